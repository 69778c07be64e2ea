use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event};
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use image_policy::api::{Condition, TrustRoot, TrustRootSpec};
use image_policy::trust::SigstoreKeys;

use crate::configmap;
use crate::errors::CompileError;
use crate::tuf::{compile_targets, TufSource};
use crate::Context;

pub const FINALIZER: &str = "trustroots.policy.sigstore.dev";

const CONDITION_KEYS_INLINED: &str = "InlineKeysOk";
const CONDITION_CONFIGMAP_UPDATED: &str = "CMUpdatedOK";

/// Runs the TrustRoot reconciler until the watch stream ends.
pub async fn run(ctx: Arc<Context>) {
    let trust_roots: Api<TrustRoot> = Api::all(ctx.client.clone());
    info!(namespace = %ctx.namespace, "starting TrustRoot reconciler");
    Controller::new(trust_roots, watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(trust_root = %object.name, "reconciled"),
                Err(error) => warn!(%error, "reconcile failed"),
            }
        })
        .await;
}

pub async fn reconcile(
    trust_root: Arc<TrustRoot>,
    ctx: Arc<Context>,
) -> Result<Action, FinalizerError<CompileError>> {
    let api: Api<TrustRoot> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER, trust_root, |event| async {
        match event {
            Event::Apply(trust_root) => apply(trust_root, ctx.clone()).await,
            Event::Cleanup(trust_root) => cleanup(trust_root, ctx.clone()).await,
        }
    })
    .await
}

pub fn error_policy(
    trust_root: Arc<TrustRoot>,
    error: &FinalizerError<CompileError>,
    ctx: Arc<Context>,
) -> Action {
    let name = trust_root.name_any();
    warn!(trust_root = %name, %error, "requeueing TrustRoot");
    Action::requeue(ctx.backoff.next(&name))
}

async fn apply(trust_root: Arc<TrustRoot>, ctx: Arc<Context>) -> Result<Action, CompileError> {
    let name = trust_root.name_any();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let entry = match compile_entry(&trust_root.spec, &ctx).await {
        Ok(entry) => entry,
        Err(error) => {
            if let Err(removal_error) =
                configmap::remove_entry(&config_maps, &ctx.sigstore_keys_configmap, &name).await
            {
                warn!(trust_root = %name, error = %removal_error, "cannot remove stale entry");
            }
            set_status(
                &ctx,
                &trust_root,
                vec![Condition::failed(
                    CONDITION_KEYS_INLINED,
                    "InlineKeysFailed",
                    &error.to_string(),
                )],
            )
            .await;
            return Err(error);
        }
    };

    if let Err(error) =
        configmap::upsert_entry(&config_maps, &ctx.sigstore_keys_configmap, &name, &entry).await
    {
        set_status(
            &ctx,
            &trust_root,
            vec![
                Condition::ok(CONDITION_KEYS_INLINED),
                Condition::failed(
                    CONDITION_CONFIGMAP_UPDATED,
                    "CMUpdateFailed",
                    &error.to_string(),
                ),
            ],
        )
        .await;
        return Err(error);
    }

    set_status(
        &ctx,
        &trust_root,
        vec![
            Condition::ok(CONDITION_KEYS_INLINED),
            Condition::ok(CONDITION_CONFIGMAP_UPDATED),
        ],
    )
    .await;
    ctx.backoff.reset(&name);
    Ok(Action::requeue(ctx.resync))
}

/// Materializes the trust material: inline keys are compiled directly,
/// serialized and remote TUF repositories go through the fetcher.
async fn compile_entry(spec: &TrustRootSpec, ctx: &Context) -> Result<String, CompileError> {
    spec.validate()?;

    let compiled: SigstoreKeys = if let Some(keys) = &spec.sigstore_keys {
        SigstoreKeys::from_spec(keys)?
    } else if let Some(repository) = &spec.repository {
        let source = TufSource::InMemory {
            mirror_gz: BASE64
                .decode(&repository.mirror_fs)
                .map_err(|e| CompileError::Tuf(e.to_string()))?,
            root: BASE64
                .decode(&repository.root)
                .map_err(|e| CompileError::Tuf(e.to_string()))?,
        };
        let targets = ctx
            .tuf
            .fetch_targets(&source, &repository.targets)
            .await
            .map_err(|e| CompileError::Tuf(e.to_string()))?;
        compile_targets(&targets)?
    } else if let Some(remote) = &spec.remote {
        let source = TufSource::Remote {
            mirror: remote.mirror.clone(),
            root: BASE64
                .decode(&remote.root)
                .map_err(|e| CompileError::Tuf(e.to_string()))?,
        };
        let targets = ctx
            .tuf
            .fetch_targets(&source, &remote.targets)
            .await
            .map_err(|e| CompileError::Tuf(e.to_string()))?;
        compile_targets(&targets)?
    } else {
        // validate() has already rejected sourceless specs
        return Err(image_policy::ValidationError::one_of_neither(&[
            "spec.sigstoreKeys",
            "spec.repository",
            "spec.remote",
        ])
        .into());
    };

    Ok(serde_json::to_string(&compiled)?)
}

async fn cleanup(trust_root: Arc<TrustRoot>, ctx: Arc<Context>) -> Result<Action, CompileError> {
    let name = trust_root.name_any();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    configmap::remove_entry(&config_maps, &ctx.sigstore_keys_configmap, &name).await?;
    info!(trust_root = %name, "removed trust root entry");
    Ok(Action::await_change())
}

async fn set_status(ctx: &Context, trust_root: &TrustRoot, conditions: Vec<Condition>) {
    let api: Api<TrustRoot> = Api::all(ctx.client.clone());
    let status = serde_json::json!({
        "status": {
            "conditions": conditions,
            "observedGeneration": trust_root.metadata.generation,
        }
    });
    if let Err(error) = api
        .patch_status(
            &trust_root.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await
    {
        warn!(trust_root = %trust_root.name_any(), %error, "cannot update status conditions");
    }
}
