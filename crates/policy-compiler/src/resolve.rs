use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::Api;
use sha2::{Digest, Sha256};
use tracing::debug;

use image_policy::api::{
    AttestationPolicy, ClusterImagePolicySpec, ConfigMapKeyRef, HashAlgorithm, KeyRef,
    PolicyRef, RemotePolicy,
};
use image_policy::trust::public_key_from_pem;

use crate::errors::CompileError;
use crate::tracker::TrackedObject;
use crate::Context;

/// Inlines every `secretRef` and `kms` reference of the spec's authorities.
/// Touched Secrets are tracked so their changes re-enqueue the policy.
pub async fn inline_keys(
    ctx: &Context,
    policy_name: &str,
    spec: &mut ClusterImagePolicySpec,
) -> Result<(), CompileError> {
    for authority in &mut spec.authorities {
        if let Some(key) = &mut authority.key {
            inline_key_ref(ctx, policy_name, key, true).await?;
        }
        if let Some(keyless) = &mut authority.keyless {
            if let Some(ca_cert) = &mut keyless.ca_cert {
                inline_key_ref(ctx, policy_name, ca_cert, false).await?;
            }
        }
    }
    Ok(())
}

async fn inline_key_ref(
    ctx: &Context,
    policy_name: &str,
    key: &mut KeyRef,
    parse_as_public_key: bool,
) -> Result<(), CompileError> {
    if let Some(secret_ref) = key.secret_ref.take() {
        let data = secret_data(ctx, policy_name, &secret_ref.name, parse_as_public_key).await?;
        key.data = Some(data);
        return Ok(());
    }
    if let Some(kms_ref) = key.kms.take() {
        let hash = key.hash_algorithm.unwrap_or(HashAlgorithm::Sha256);
        let pem = ctx
            .kms
            .public_key(&kms_ref, hash)
            .await
            .map_err(|e| CompileError::Kms {
                reference: kms_ref.clone(),
                reason: e.to_string(),
            })?;
        key.data = Some(pem);
    }
    Ok(())
}

/// Fetches the Secret, requires exactly one data entry, and returns it as
/// UTF-8 PEM.
async fn secret_data(
    ctx: &Context,
    policy_name: &str,
    secret_name: &str,
    parse_as_public_key: bool,
) -> Result<String, CompileError> {
    let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let secret = api.get(secret_name).await?;
    ctx.tracker.track(
        TrackedObject::secret(&ctx.namespace, secret_name),
        policy_name,
    );

    let data = secret.data.unwrap_or_default();
    match data.len() {
        0 => Err(CompileError::EmptySecret {
            name: secret_name.to_string(),
        }),
        1 => {
            let bytes = data.into_values().next().expect("one entry");
            let pem = String::from_utf8(bytes.0).map_err(|e| CompileError::InvalidSecretKey {
                name: secret_name.to_string(),
                reason: e.to_string(),
            })?;
            if parse_as_public_key {
                public_key_from_pem(&pem).map_err(|e| CompileError::InvalidSecretKey {
                    name: secret_name.to_string(),
                    reason: e.to_string(),
                })?;
            }
            Ok(pem)
        }
        _ => Err(CompileError::AmbiguousSecret {
            name: secret_name.to_string(),
        }),
    }
}

/// Inlines the CIP-level policy body and every attestation policy body:
/// ConfigMap references are fetched and tracked, remote documents are
/// fetched and integrity-checked.
pub async fn inline_policies(
    ctx: &Context,
    policy_name: &str,
    spec: &mut ClusterImagePolicySpec,
) -> Result<(), CompileError> {
    if let Some(policy) = &mut spec.policy {
        inline_cip_policy(ctx, policy_name, policy).await?;
    }
    for authority in &mut spec.authorities {
        for attestation in &mut authority.attestations {
            if let Some(policy) = &mut attestation.policy {
                inline_attestation_policy(ctx, policy_name, policy).await?;
            }
        }
    }
    Ok(())
}

async fn inline_cip_policy(
    ctx: &Context,
    policy_name: &str,
    policy: &mut PolicyRef,
) -> Result<(), CompileError> {
    if let Some(config_map_ref) = policy.config_map_ref.take() {
        policy.data = Some(config_map_value(ctx, policy_name, &config_map_ref).await?);
        return Ok(());
    }
    if let Some(remote) = policy.remote.take() {
        policy.data = Some(fetch_remote_policy(ctx, &remote).await?);
    }
    Ok(())
}

async fn inline_attestation_policy(
    ctx: &Context,
    policy_name: &str,
    policy: &mut AttestationPolicy,
) -> Result<(), CompileError> {
    if let Some(config_map_ref) = policy.config_map_ref.take() {
        policy.data = Some(config_map_value(ctx, policy_name, &config_map_ref).await?);
    }
    Ok(())
}

async fn config_map_value(
    ctx: &Context,
    policy_name: &str,
    config_map_ref: &ConfigMapKeyRef,
) -> Result<String, CompileError> {
    let api: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let config_map = api.get(&config_map_ref.name).await?;
    ctx.tracker.track(
        TrackedObject::config_map(&ctx.namespace, &config_map_ref.name),
        policy_name,
    );

    config_map
        .data
        .unwrap_or_default()
        .get(&config_map_ref.key)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| CompileError::MissingConfigMapKey {
            name: config_map_ref.name.clone(),
            key: config_map_ref.key.clone(),
        })
}

async fn fetch_remote_policy(ctx: &Context, remote: &RemotePolicy) -> Result<String, CompileError> {
    debug!(url = %remote.url, "fetching remote policy body");
    let response = ctx
        .http
        .get(&remote.url)
        .send()
        .await
        .map_err(|e| CompileError::RemoteFetch {
            url: remote.url.clone(),
            reason: e.to_string(),
        })?;
    if !response.status().is_success() {
        return Err(CompileError::RemoteFetch {
            url: remote.url.clone(),
            reason: format!("unexpected status {}", response.status()),
        });
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| CompileError::RemoteFetch {
            url: remote.url.clone(),
            reason: e.to_string(),
        })?;
    verify_sha256(&remote.url, &body, &remote.sha256sum)?;
    String::from_utf8(body.to_vec()).map_err(|e| CompileError::RemoteFetch {
        url: remote.url.clone(),
        reason: e.to_string(),
    })
}

/// Byte-for-byte integrity check of a remote policy body.
pub(crate) fn verify_sha256(url: &str, body: &[u8], expected: &str) -> Result<(), CompileError> {
    let computed = hex::encode(Sha256::digest(body));
    if computed != expected {
        return Err(CompileError::ShaMismatch {
            url: url.to_string(),
            expected: expected.to_string(),
            computed,
        });
    }
    Ok(())
}
