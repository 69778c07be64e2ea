use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlobError {
    #[error("image glob is empty")]
    Empty,
    #[error("cannot compile image glob {glob}: {source}")]
    BadPattern {
        glob: String,
        #[source]
        source: regex::Error,
    },
}

/// A compiled image name pattern.
///
/// `*` matches any run of characters that does not contain `/`, `**` matches
/// any run of characters. A pattern that pins a digest (contains
/// `@sha256:`) is compared literally, so policies can target one exact
/// image.
#[derive(Debug, Clone)]
pub enum Glob {
    Literal(String),
    Pattern(Regex),
}

impl Glob {
    pub fn compile(glob: &str) -> Result<Glob, GlobError> {
        if glob.is_empty() {
            return Err(GlobError::Empty);
        }
        if glob.contains("@sha256:") {
            return Ok(Glob::Literal(glob.to_string()));
        }

        let mut regex = String::with_capacity(glob.len() + 8);
        regex.push('^');
        let mut chars = glob.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if chars.peek() == Some(&'*') {
                        chars.next();
                        regex.push_str(".*");
                    } else {
                        regex.push_str("[^/]*");
                    }
                }
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');

        let compiled = Regex::new(&regex).map_err(|source| GlobError::BadPattern {
            glob: glob.to_string(),
            source,
        })?;
        Ok(Glob::Pattern(compiled))
    }

    pub fn matches(&self, image: &str) -> bool {
        match self {
            Glob::Literal(l) => l == image,
            Glob::Pattern(re) => re.is_match(image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("gcr.io/*/*", "gcr.io/distroless/static", true)]
    #[case("gcr.io/*/*", "gcr.io/distroless/nested/static", false)]
    #[case("gcr.io/**", "gcr.io/distroless/nested/static", true)]
    #[case("**", "anything.example.com/repo/image", true)]
    #[case("*", "quay.io/repo", false)]
    #[case("*", "ubuntu", true)]
    #[case("gcr.io/project/image", "gcr.io/project/image", true)]
    #[case("gcr.io/project/image", "gcr.io/project/image2", false)]
    #[case("index.docker.io/library/*", "index.docker.io/library/busybox", true)]
    fn glob_matching(#[case] glob: &str, #[case] image: &str, #[case] expected: bool) {
        let compiled = Glob::compile(glob).expect("glob must compile");
        assert_eq!(compiled.matches(image), expected, "glob {glob} vs {image}");
    }

    #[test]
    fn digest_pattern_is_literal() {
        let image = "gcr.io/distroless/static@sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4";
        let compiled = Glob::compile(image).unwrap();
        assert!(matches!(compiled, Glob::Literal(_)));
        assert!(compiled.matches(image));
        assert!(!compiled.matches("gcr.io/distroless/static"));
    }

    #[test]
    fn regex_metacharacters_are_escaped() {
        let compiled = Glob::compile("gcr.io/pro.ject/image").unwrap();
        assert!(!compiled.matches("gcr.io/proXject/image"));
        assert!(compiled.matches("gcr.io/pro.ject/image"));
    }

    #[test]
    fn empty_glob_is_rejected() {
        assert!(matches!(Glob::compile(""), Err(GlobError::Empty)));
    }
}
