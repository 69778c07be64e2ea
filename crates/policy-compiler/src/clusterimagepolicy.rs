use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use image_policy::api::{ClusterImagePolicy, Condition};
use image_policy::compiled::CompiledClusterImagePolicy;

use crate::configmap;
use crate::errors::CompileError;
use crate::resolve;
use crate::tracker::TrackedObject;
use crate::Context;

pub const FINALIZER: &str = "clusterimagepolicies.policy.sigstore.dev";

const CONDITION_KEYS_INLINED: &str = "KeysInlined";
const CONDITION_POLICIES_INLINED: &str = "PoliciesInlined";
const CONDITION_CONFIGMAP_UPDATED: &str = "ConfigMapUpdated";

/// Runs the ClusterImagePolicy reconciler until the watch streams end.
/// Referenced Secrets and ConfigMaps re-enqueue their dependents through
/// the tracker.
pub async fn run(ctx: Arc<Context>) {
    let policies: Api<ClusterImagePolicy> = Api::all(ctx.client.clone());
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let secret_tracker = ctx.tracker.clone();
    let config_map_tracker = ctx.tracker.clone();

    info!(namespace = %ctx.namespace, "starting ClusterImagePolicy reconciler");
    Controller::new(policies, watcher::Config::default())
        .watches(secrets, watcher::Config::default(), move |secret| {
            let object = TrackedObject::secret(
                secret.namespace().as_deref().unwrap_or_default(),
                &secret.name_any(),
            );
            secret_tracker
                .dependents(&object)
                .into_iter()
                .map(|name| ObjectRef::new(&name))
        })
        .watches(config_maps, watcher::Config::default(), move |config_map| {
            let object = TrackedObject::config_map(
                config_map.namespace().as_deref().unwrap_or_default(),
                &config_map.name_any(),
            );
            config_map_tracker
                .dependents(&object)
                .into_iter()
                .map(|name| ObjectRef::new(&name))
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(policy = %object.name, "reconciled"),
                Err(error) => warn!(%error, "reconcile failed"),
            }
        })
        .await;
}

pub async fn reconcile(
    cip: Arc<ClusterImagePolicy>,
    ctx: Arc<Context>,
) -> Result<Action, FinalizerError<CompileError>> {
    let api: Api<ClusterImagePolicy> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER, cip, |event| async {
        match event {
            Event::Apply(cip) => apply(cip, ctx.clone()).await,
            Event::Cleanup(cip) => cleanup(cip, ctx.clone()).await,
        }
    })
    .await
}

pub fn error_policy(
    cip: Arc<ClusterImagePolicy>,
    error: &FinalizerError<CompileError>,
    ctx: Arc<Context>,
) -> Action {
    let name = cip.name_any();
    warn!(policy = %name, %error, "requeueing ClusterImagePolicy");
    Action::requeue(ctx.backoff.next(&name))
}

async fn apply(
    cip: Arc<ClusterImagePolicy>,
    ctx: Arc<Context>,
) -> Result<Action, CompileError> {
    let name = cip.name_any();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    let entry = match compile_entry(&cip, &ctx).await {
        Ok(entry) => entry,
        Err((condition, error)) => {
            // A broken policy must not keep an admitting entry live.
            if let Err(removal_error) =
                configmap::remove_entry(&config_maps, &ctx.image_policies_configmap, &name).await
            {
                warn!(policy = %name, error = %removal_error, "cannot remove stale entry");
            }
            set_status(&ctx, &cip, vec![condition]).await;
            return Err(error);
        }
    };

    if let Err(error) =
        configmap::upsert_entry(&config_maps, &ctx.image_policies_configmap, &name, &entry).await
    {
        set_status(
            &ctx,
            &cip,
            vec![
                Condition::ok(CONDITION_KEYS_INLINED),
                Condition::ok(CONDITION_POLICIES_INLINED),
                Condition::failed(
                    CONDITION_CONFIGMAP_UPDATED,
                    "UpdateFailed",
                    &error.to_string(),
                ),
            ],
        )
        .await;
        return Err(error);
    }

    set_status(
        &ctx,
        &cip,
        vec![
            Condition::ok(CONDITION_KEYS_INLINED),
            Condition::ok(CONDITION_POLICIES_INLINED),
            Condition::ok(CONDITION_CONFIGMAP_UPDATED),
        ],
    )
    .await;
    ctx.backoff.reset(&name);
    Ok(Action::requeue(ctx.resync))
}

/// Validates the authored spec, inlines its external references and
/// renders the canonical ConfigMap entry. Failures name the condition
/// they belong on.
async fn compile_entry(
    cip: &ClusterImagePolicy,
    ctx: &Context,
) -> Result<String, (Condition, CompileError)> {
    let name = cip.name_any();

    if let Err(error) = cip.spec.validate() {
        return Err((
            Condition::failed(
                CONDITION_KEYS_INLINED,
                "ValidationFailed",
                &error.to_string(),
            ),
            error.into(),
        ));
    }

    let mut spec = cip.spec.clone();
    if let Err(error) = resolve::inline_keys(ctx, &name, &mut spec).await {
        return Err((
            Condition::failed(CONDITION_KEYS_INLINED, "InliningFailed", &error.to_string()),
            error,
        ));
    }
    if let Err(error) = resolve::inline_policies(ctx, &name, &mut spec).await {
        return Err((
            Condition::failed(
                CONDITION_POLICIES_INLINED,
                "InliningFailed",
                &error.to_string(),
            ),
            error,
        ));
    }

    let uid = cip.metadata.uid.clone().unwrap_or_default();
    let resource_version = cip.metadata.resource_version.clone().unwrap_or_default();
    let compiled = CompiledClusterImagePolicy::from_spec(&spec, &uid, &resource_version)
        .map_err(|error| {
            let error: CompileError = error.into();
            (
                Condition::failed(CONDITION_KEYS_INLINED, "CompileFailed", &error.to_string()),
                error,
            )
        })?;
    compiled.canonical_json().map_err(|error| {
        let error: CompileError = error.into();
        (
            Condition::failed(CONDITION_KEYS_INLINED, "CompileFailed", &error.to_string()),
            error,
        )
    })
}

async fn cleanup(
    cip: Arc<ClusterImagePolicy>,
    ctx: Arc<Context>,
) -> Result<Action, CompileError> {
    let name = cip.name_any();
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    configmap::remove_entry(&config_maps, &ctx.image_policies_configmap, &name).await?;
    ctx.tracker.forget(&name);
    info!(policy = %name, "removed policy entry");
    Ok(Action::await_change())
}

async fn set_status(ctx: &Context, cip: &ClusterImagePolicy, conditions: Vec<Condition>) {
    let api: Api<ClusterImagePolicy> = Api::all(ctx.client.clone());
    let status = serde_json::json!({
        "status": {
            "conditions": conditions,
            "observedGeneration": cip.metadata.generation,
        }
    });
    if let Err(error) = api
        .patch_status(
            &cip.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await
    {
        warn!(policy = %cip.name_any(), %error, "cannot update status conditions");
    }
}
