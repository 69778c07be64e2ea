//! Constraint checker for the CUE subset image policies actually use:
//! struct and list constraints, scalar equality, type idents, comparison
//! and regex operators, and disjunctions. A JSON document satisfies a
//! policy when it is an instance of the constraint value.
//!
//! TODO: support field comprehensions and string interpolations.

use regex::Regex;

use super::PolicyEvalError;

pub fn evaluate(source: &str, input: &serde_json::Value) -> Result<(), PolicyEvalError> {
    let constraint = parse(source).map_err(PolicyEvalError::CueCompile)?;
    check(&constraint, input, "").map_err(PolicyEvalError::CueEval)
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Struct(Vec<(String, Value)>),
    /// Exact element-wise list.
    List(Vec<Value>),
    /// `[...X]`: any number of elements, each an instance of X.
    OpenList(Option<Box<Value>>),
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    /// `string`, `number`, `int`, `float`, `bool`
    Type(&'static str),
    /// `_`
    Top,
    Compare(CompareOp, f64),
    Regex { pattern: String, negated: bool },
    Disjunction(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Newline,
    Pipe,
    Ellipsis,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
    Match,
    NotMatch,
    Str(String),
    Num(f64),
    Ident(String),
    Eof,
}

fn token_name(token: &Token) -> String {
    match token {
        Token::Str(s) => format!("{s:?}"),
        Token::Num(n) => n.to_string(),
        Token::Ident(i) => i.clone(),
        Token::Eof => "EOF".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn scan(source: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' => {
                chars.next();
                if !matches!(tokens.last(), Some(Token::Newline) | None) {
                    tokens.push(Token::Newline);
                }
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    while let Some(&c) = chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        chars.next();
                    }
                } else {
                    return Err("unexpected character '/'".to_string());
                }
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '.' => {
                chars.next();
                if chars.next() == Some('.') && chars.next() == Some('.') {
                    tokens.push(Token::Ellipsis);
                } else {
                    return Err("unexpected character '.'".to_string());
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Ne),
                    Some('~') => tokens.push(Token::NotMatch),
                    _ => return Err("unexpected character '!'".to_string()),
                }
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('~') => tokens.push(Token::Match),
                    _ => return Err("unexpected character '='".to_string()),
                }
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None | Some('\n') => {
                            return Err("string literal not terminated".to_string())
                        }
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('\\') => value.push('\\'),
                            Some('"') => value.push('"'),
                            Some('/') => value.push('/'),
                            Some(other) => {
                                return Err(format!("invalid escape sequence '\\{other}'"))
                            }
                            None => return Err("string literal not terminated".to_string()),
                        },
                        Some(other) => value.push(other),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || c == '-' || c == '+'
                    {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number literal {literal:?}"))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '#' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '#' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.position]
    }

    fn next(&mut self) -> Token {
        let token = self.tokens[self.position].clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        token
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Token::Newline) {
            self.next();
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        let token = self.next();
        if token == expected {
            Ok(())
        } else {
            Err(format!(
                "expected {}, found {}",
                token_name(&expected),
                token_name(&token)
            ))
        }
    }

    /// value := unary ('|' unary)*
    fn value(&mut self) -> Result<Value, String> {
        self.skip_newlines();
        let first = self.unary()?;
        let mut branches = vec![first];
        loop {
            // A disjunction may continue on the next line after the '|'.
            let checkpoint = self.position;
            self.skip_newlines();
            if matches!(self.peek(), Token::Pipe) {
                self.next();
                self.skip_newlines();
                branches.push(self.unary()?);
            } else {
                self.position = checkpoint;
                break;
            }
        }
        if branches.len() == 1 {
            Ok(branches.pop().expect("one branch"))
        } else {
            Ok(Value::Disjunction(branches))
        }
    }

    fn unary(&mut self) -> Result<Value, String> {
        match self.next() {
            Token::LBrace => self.struct_body(),
            Token::LBracket => self.list_body(),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Num(n) => Ok(Value::Number(n)),
            Token::Ident(ident) => match ident.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                "string" => Ok(Value::Type("string")),
                "number" => Ok(Value::Type("number")),
                "int" => Ok(Value::Type("int")),
                "float" => Ok(Value::Type("float")),
                "bool" => Ok(Value::Type("bool")),
                "_" => Ok(Value::Top),
                other => Err(format!("reference to undefined value {other}")),
            },
            Token::Lt => self.comparison(CompareOp::Lt),
            Token::Le => self.comparison(CompareOp::Le),
            Token::Gt => self.comparison(CompareOp::Gt),
            Token::Ge => self.comparison(CompareOp::Ge),
            Token::Ne => self.comparison(CompareOp::Ne),
            Token::Match => self.regex(false),
            Token::NotMatch => self.regex(true),
            token => Err(format!("expected operand, found {}", token_name(&token))),
        }
    }

    fn comparison(&mut self, op: CompareOp) -> Result<Value, String> {
        match self.next() {
            Token::Num(bound) => Ok(Value::Compare(op, bound)),
            token => Err(format!(
                "expected number after comparison operator, found {}",
                token_name(&token)
            )),
        }
    }

    fn regex(&mut self, negated: bool) -> Result<Value, String> {
        match self.next() {
            Token::Str(pattern) => {
                Regex::new(&pattern).map_err(|e| format!("invalid regular expression: {e}"))?;
                Ok(Value::Regex { pattern, negated })
            }
            token => Err(format!(
                "expected string after match operator, found {}",
                token_name(&token)
            )),
        }
    }

    /// Body after the opening brace.
    fn struct_body(&mut self) -> Result<Value, String> {
        let mut fields: Vec<(String, Value)> = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), Token::RBrace) {
                self.next();
                return Ok(Value::Struct(fields));
            }
            let label = match self.next() {
                Token::Ident(ident) => ident,
                Token::Str(s) => s,
                token => {
                    return Err(format!("expected field label, found {}", token_name(&token)))
                }
            };
            self.expect(Token::Colon)?;
            let value = self.value()?;
            fields.push((label, value));
            match self.peek() {
                Token::Comma | Token::Newline => {
                    self.next();
                }
                Token::RBrace => {}
                token => {
                    return Err(format!(
                        "expected comma or newline after field, found {}",
                        token_name(token)
                    ))
                }
            }
        }
    }

    /// Body after the opening bracket.
    fn list_body(&mut self) -> Result<Value, String> {
        self.skip_newlines();
        if matches!(self.peek(), Token::Ellipsis) {
            self.next();
            self.skip_newlines();
            if matches!(self.peek(), Token::RBracket) {
                self.next();
                return Ok(Value::OpenList(None));
            }
            let element = self.value()?;
            self.skip_newlines();
            self.expect(Token::RBracket)?;
            return Ok(Value::OpenList(Some(Box::new(element))));
        }
        let mut elements = Vec::new();
        loop {
            self.skip_newlines();
            if matches!(self.peek(), Token::RBracket) {
                self.next();
                return Ok(Value::List(elements));
            }
            elements.push(self.value()?);
            self.skip_newlines();
            match self.peek() {
                Token::Comma => {
                    self.next();
                }
                Token::RBracket => {}
                token => {
                    return Err(format!(
                        "expected comma or closing bracket, found {}",
                        token_name(token)
                    ))
                }
            }
        }
    }
}

fn parse(source: &str) -> Result<Value, String> {
    let tokens = scan(source)?;
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    parser.skip_newlines();
    // A policy may be a braced struct or a bare list of top-level fields.
    let value = if matches!(parser.peek(), Token::LBrace) {
        parser.value()?
    } else {
        let mut fields = Vec::new();
        loop {
            parser.skip_newlines();
            if matches!(parser.peek(), Token::Eof) {
                break;
            }
            let label = match parser.next() {
                Token::Ident(ident) => ident,
                Token::Str(s) => s,
                token => {
                    return Err(format!("expected field label, found {}", token_name(&token)))
                }
            };
            parser.expect(Token::Colon)?;
            fields.push((label, parser.value()?));
        }
        Value::Struct(fields)
    };
    parser.skip_newlines();
    if !matches!(parser.peek(), Token::Eof) {
        return Err(format!(
            "expected end of file, found {}",
            token_name(parser.peek())
        ));
    }
    Ok(value)
}

fn join(path: &str, label: &str) -> String {
    if path.is_empty() {
        label.to_string()
    } else {
        format!("{path}.{label}")
    }
}

fn check(constraint: &Value, actual: &serde_json::Value, path: &str) -> Result<(), String> {
    match constraint {
        Value::Top => Ok(()),
        Value::Struct(fields) => {
            let object = actual
                .as_object()
                .ok_or_else(|| format!("{path}: conflicting values, expected a struct"))?;
            for (label, field_constraint) in fields {
                let field_path = join(path, label);
                let field = object
                    .get(label)
                    .ok_or_else(|| format!("{field_path}: field not found"))?;
                check(field_constraint, field, &field_path)?;
            }
            Ok(())
        }
        Value::List(elements) => {
            let array = actual
                .as_array()
                .ok_or_else(|| format!("{path}: conflicting values, expected a list"))?;
            if array.len() != elements.len() {
                return Err(format!(
                    "{path}: incompatible list lengths ({} and {})",
                    array.len(),
                    elements.len()
                ));
            }
            for (i, (element_constraint, element)) in
                elements.iter().zip(array.iter()).enumerate()
            {
                check(element_constraint, element, &join(path, &i.to_string()))?;
            }
            Ok(())
        }
        Value::OpenList(element_constraint) => {
            let array = actual
                .as_array()
                .ok_or_else(|| format!("{path}: conflicting values, expected a list"))?;
            if let Some(element_constraint) = element_constraint {
                for (i, element) in array.iter().enumerate() {
                    check(element_constraint, element, &join(path, &i.to_string()))?;
                }
            }
            Ok(())
        }
        Value::String(expected) => match actual.as_str() {
            Some(s) if s == expected => Ok(()),
            _ => Err(format!(
                "{path}: conflicting values {actual} and {expected:?}"
            )),
        },
        Value::Number(expected) => match actual.as_f64() {
            Some(n) if n == *expected => Ok(()),
            _ => Err(format!(
                "{path}: conflicting values {actual} and {expected}"
            )),
        },
        Value::Bool(expected) => match actual.as_bool() {
            Some(b) if b == *expected => Ok(()),
            _ => Err(format!(
                "{path}: conflicting values {actual} and {expected}"
            )),
        },
        Value::Null => {
            if actual.is_null() {
                Ok(())
            } else {
                Err(format!("{path}: conflicting values {actual} and null"))
            }
        }
        Value::Type(name) => {
            let ok = match *name {
                "string" => actual.is_string(),
                "bool" => actual.is_boolean(),
                "number" | "float" => actual.is_number(),
                "int" => actual.is_i64() || actual.is_u64(),
                _ => false,
            };
            if ok {
                Ok(())
            } else {
                Err(format!("{path}: conflicting values {actual} and {name}"))
            }
        }
        Value::Compare(op, bound) => {
            let n = actual
                .as_f64()
                .ok_or_else(|| format!("{path}: conflicting values {actual}, expected a number"))?;
            let ok = match op {
                CompareOp::Lt => n < *bound,
                CompareOp::Le => n <= *bound,
                CompareOp::Gt => n > *bound,
                CompareOp::Ge => n >= *bound,
                CompareOp::Ne => n != *bound,
            };
            if ok {
                Ok(())
            } else {
                Err(format!("{path}: invalid value {actual} (out of bound)"))
            }
        }
        Value::Regex { pattern, negated } => {
            let s = actual
                .as_str()
                .ok_or_else(|| format!("{path}: conflicting values {actual}, expected a string"))?;
            let re = Regex::new(pattern).map_err(|e| format!("{path}: {e}"))?;
            if re.is_match(s) != *negated {
                Ok(())
            } else {
                Err(format!(
                    "{path}: invalid value {actual} (does not satisfy =~{pattern:?})"
                ))
            }
        }
        Value::Disjunction(branches) => {
            let mut errors = Vec::new();
            for branch in branches {
                match check(branch, actual, path) {
                    Ok(()) => return Ok(()),
                    Err(e) => errors.push(e),
                }
            }
            Err(format!(
                "{path}: no disjunction branch satisfied: {}",
                errors.join("; ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unterminated_string_reports_the_scanner_error() {
        assert_eq!(
            parse("{\"wontgo").unwrap_err(),
            "string literal not terminated"
        );
    }

    #[test]
    fn struct_constraints_are_open() {
        let input = json!({
            "authorityMatches": {
                "authority-0": {"static": true},
                "extra": {"signatures": []}
            }
        });
        evaluate(
            "authorityMatches: { \"authority-0\": { static: true } }",
            &input,
        )
        .unwrap();
    }

    #[test]
    fn missing_field_fails() {
        let err = evaluate(
            "authorityMatches: { \"authority-1\": { static: true } }",
            &json!({"authorityMatches": {}}),
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("authorityMatches.authority-1: field not found"));
    }

    #[test]
    fn scalar_conflicts_fail() {
        let err = evaluate(
            "predicateType: \"https://slsa.dev/provenance/v0.2\"",
            &json!({"predicateType": "https://spdx.dev/Document"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("conflicting values"));
    }

    #[test]
    fn open_lists_check_every_element() {
        let policy = r#"
signatures: [...{
    issuer: "https://token.actions.githubusercontent.com"
    subject: =~"^https://github\\.com/example/"
}]
"#;
        let good = json!({"signatures": [
            {"issuer": "https://token.actions.githubusercontent.com",
             "subject": "https://github.com/example/app/.github/workflows/release.yml@refs/heads/main"}
        ]});
        evaluate(policy, &good).unwrap();

        let bad = json!({"signatures": [
            {"issuer": "https://token.actions.githubusercontent.com",
             "subject": "https://github.com/evil/app"}
        ]});
        assert!(evaluate(policy, &bad).is_err());
    }

    #[test]
    fn disjunctions_accept_any_branch() {
        let policy = "predicate: { Data: \"foo\" | \"bar\" }";
        evaluate(policy, &json!({"predicate": {"Data": "bar"}})).unwrap();
        assert!(evaluate(policy, &json!({"predicate": {"Data": "baz"}})).is_err());
    }

    #[test]
    fn type_and_comparison_constraints() {
        let policy = "{ subject: string, count: >=1 }";
        evaluate(policy, &json!({"subject": "x", "count": 3})).unwrap();
        assert!(evaluate(policy, &json!({"subject": 7, "count": 3})).is_err());
        assert!(evaluate(policy, &json!({"subject": "x", "count": 0})).is_err());
    }

    #[test]
    fn comments_and_newline_separators() {
        let policy = r#"
// requires a static pass
authorityMatches: {
    "authority-0": {
        static: true
    }
}
"#;
        evaluate(
            policy,
            &json!({"authorityMatches": {"authority-0": {"static": true}}}),
        )
        .unwrap();
    }

    #[test]
    fn undefined_references_are_compile_errors() {
        let err = evaluate("field: unknownIdent", &json!({})).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to compile the cue policy with error:"));
    }
}
