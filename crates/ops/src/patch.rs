//! Minimal strategic-merge payloads for incremental mutations.
//!
//! Every payload touches only the fields its mutation names. Env mutations are
//! scoped to one container by name and stamp the pod template so the rollout
//! controller sees a template change even when only env values moved.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use drydock_core::{manifest::env_var, EnvBinding, ResourceKind, ResourceRef};
use drydock_kubehub::{StoreError, Stores};
use metrics::{counter, histogram};
use serde_json::{json, Value as Json};
use tracing::info;

/// Pod-template annotation carrying the patch timestamp.
pub const DATE_ANNOTATION: &str = "date";
pub const CHANGE_CAUSE_ANNOTATION: &str = "kubernetes.io/change-cause";
const ENV_CHANGE_CAUSE: &str = "update env vars";
const PATCH_DIRECTIVE: &str = "$patch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Add or replace literal variables.
    SetEnv { container: String, vars: Vec<(String, String)> },
    /// Variables named after each key, read from that key of `secret`.
    SetSecretEnv { container: String, secret: String, keys: Vec<String> },
    UnsetEnv { container: String, names: Vec<String> },
    Scale(i32),
    /// Revision number as given by the caller, e.g. `"3"`.
    Rollback(String),
    /// The complete desired annotation map.
    Annotations(BTreeMap<String, String>),
}

impl Mutation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mutation::SetEnv { .. } => "set_env",
            Mutation::SetSecretEnv { .. } => "set_secret_env",
            Mutation::UnsetEnv { .. } => "unset_env",
            Mutation::Scale(_) => "scale",
            Mutation::Rollback(_) => "rollback",
            Mutation::Annotations(_) => "annotations",
        }
    }

    fn is_env(&self) -> bool {
        matches!(self, Mutation::SetEnv { .. } | Mutation::SetSecretEnv { .. } | Mutation::UnsetEnv { .. })
    }
}

/// A payload built for one request and one target.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPayload {
    pub target: ResourceRef,
    pub body: Json,
    /// Set for env mutations: the value written to the `date` annotation.
    pub stamped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("invalid patch: {0}")]
    Invalid(String),
    #[error("encoding patch: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("patch {kind} failed: {source}")]
    Apply {
        kind: ResourceKind,
        #[source]
        source: StoreError,
    },
}

impl PatchError {
    /// `true` when the payload was never sent.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, PatchError::Apply { .. })
    }
}

/// Build the payload for `mutation` on `target`. No I/O.
pub fn build(target: &ResourceRef, mutation: &Mutation, now: DateTime<Utc>) -> Result<PatchPayload, PatchError> {
    check_target(target, mutation)?;
    let (body, stamped_at) = match mutation {
        Mutation::SetEnv { container, vars } => {
            require_container(container)?;
            let bindings = vars
                .iter()
                .map(|(k, v)| {
                    require_env_name(k)?;
                    Ok(EnvBinding::literal(k.clone(), v.clone()))
                })
                .collect::<Result<Vec<_>, PatchError>>()?;
            (env_patch(target.kind, container, encode_bindings(&bindings)?, now)?, Some(now))
        }
        Mutation::SetSecretEnv { container, secret, keys } => {
            require_container(container)?;
            if secret.is_empty() {
                return Err(PatchError::Invalid("secret name must not be empty".into()));
            }
            let bindings = keys
                .iter()
                .map(|k| {
                    require_env_name(k)?;
                    Ok(EnvBinding::from_secret(k.clone(), secret.clone(), k.clone()))
                })
                .collect::<Result<Vec<_>, PatchError>>()?;
            (env_patch(target.kind, container, encode_bindings(&bindings)?, now)?, Some(now))
        }
        Mutation::UnsetEnv { container, names } => {
            require_container(container)?;
            let entries = names
                .iter()
                .map(|n| {
                    require_env_name(n)?;
                    Ok(json!({"name": n, "$patch": "delete"}))
                })
                .collect::<Result<Vec<_>, PatchError>>()?;
            (env_patch(target.kind, container, Json::Array(entries), now)?, Some(now))
        }
        Mutation::Scale(replicas) => {
            if *replicas < 0 {
                return Err(PatchError::Invalid(format!("replicas must be >= 0 (got {replicas})")));
            }
            (json!({"spec": {"replicas": replicas}}), None)
        }
        Mutation::Rollback(revision) => {
            let rev: i64 = revision
                .trim()
                .parse()
                .map_err(|_| PatchError::Invalid(format!("revision {revision:?} is not a number")))?;
            (json!({"spec": {"rollbackTo": {"revision": rev}}}), None)
        }
        Mutation::Annotations(map) => {
            let mut annotations = serde_json::to_value(map)?;
            if let Json::Object(entries) = &mut annotations {
                entries.insert(PATCH_DIRECTIVE.to_string(), Json::from("replace"));
            }
            (json!({"metadata": {"annotations": annotations}}), None)
        }
    };
    Ok(PatchPayload { target: target.clone(), body, stamped_at })
}

fn check_target(target: &ResourceRef, mutation: &Mutation) -> Result<(), PatchError> {
    if target.namespace.is_empty() || target.name.is_empty() {
        return Err(PatchError::Invalid("target namespace and name must not be empty".into()));
    }
    let ok = match mutation {
        m if m.is_env() => matches!(target.kind, ResourceKind::Deployment | ResourceKind::CronJob),
        Mutation::Scale(_) | Mutation::Rollback(_) => target.kind == ResourceKind::Deployment,
        _ => true,
    };
    if !ok {
        return Err(PatchError::Invalid(format!("{} does not apply to {}", mutation.as_str(), target.kind)));
    }
    Ok(())
}

fn require_container(name: &str) -> Result<(), PatchError> {
    if name.is_empty() {
        return Err(PatchError::Invalid("container name must not be empty".into()));
    }
    Ok(())
}

fn require_env_name(name: &str) -> Result<(), PatchError> {
    if name.is_empty() {
        return Err(PatchError::Invalid("env var name must not be empty".into()));
    }
    Ok(())
}

fn encode_bindings(bindings: &[EnvBinding]) -> Result<Json, PatchError> {
    if bindings.is_empty() {
        return Err(PatchError::Invalid("no env vars given".into()));
    }
    let vars: Vec<_> = bindings.iter().map(env_var).collect();
    Ok(serde_json::to_value(vars)?)
}

fn env_patch(kind: ResourceKind, container: &str, env: Json, now: DateTime<Utc>) -> Result<Json, PatchError> {
    if env.as_array().map_or(true, Vec::is_empty) {
        return Err(PatchError::Invalid("no env vars given".into()));
    }
    let template = json!({
        "metadata": {"annotations": {DATE_ANNOTATION: now.to_rfc3339_opts(SecondsFormat::Secs, true)}},
        "spec": {"containers": [{"name": container, "env": env}]},
    });
    let spec = match kind {
        ResourceKind::CronJob => json!({"jobTemplate": {"spec": {"template": template}}}),
        _ => json!({"template": template}),
    };
    Ok(json!({
        "metadata": {"annotations": {CHANGE_CAUSE_ANNOTATION: ENV_CHANGE_CAUSE}},
        "spec": spec,
    }))
}

/// Build and send `mutation` through the store for `target.kind`.
pub async fn apply_patch(stores: &Stores, target: &ResourceRef, mutation: &Mutation) -> Result<PatchPayload, PatchError> {
    let payload = build(target, mutation, Utc::now())?;
    let t0 = Instant::now();
    let (ns, name, body) = (target.namespace.as_str(), target.name.as_str(), &payload.body);
    let sent = match target.kind {
        ResourceKind::Deployment => stores.deployments.patch(ns, name, body).await.map(drop),
        ResourceKind::CronJob => stores.cron_jobs.patch(ns, name, body).await.map(drop),
        ResourceKind::Pod => stores.pods.patch(ns, name, body).await.map(drop),
        ResourceKind::ConfigMap => stores.config_maps.patch(ns, name, body).await.map(drop),
        ResourceKind::Secret => stores.secrets.patch(ns, name, body).await.map(drop),
        ResourceKind::HorizontalPodAutoscaler => stores.autoscalers.patch(ns, name, body).await.map(drop),
        ResourceKind::Service => stores.services.patch(ns, name, body).await.map(drop),
    };
    if let Err(source) = sent {
        counter!("patch_err", 1u64, "mutation" => mutation.as_str());
        return Err(PatchError::Apply { kind: target.kind, source });
    }
    histogram!("patch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("patch_total", 1u64, "mutation" => mutation.as_str());
    info!(resource = %target, mutation = mutation.as_str(), "patched");
    Ok(payload)
}
