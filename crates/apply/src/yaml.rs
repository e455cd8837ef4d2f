//! Multi-document manifest files.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret};
use serde::Deserialize;
use serde_json::Value as Json;

use crate::ApplyError;

fn max_yaml_bytes() -> usize {
    std::env::var("DRYDOCK_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_docs() -> usize {
    std::env::var("DRYDOCK_MAX_YAML_DOCS").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(64)
}

/// A parsed manifest of one of the kinds the applier manages.
#[derive(Debug, Clone)]
pub enum KindedManifest {
    Deployment(Deployment),
    CronJob(CronJob),
    Pod(Pod),
    ConfigMap(ConfigMap),
    Secret(Secret),
    HorizontalPodAutoscaler(HorizontalPodAutoscaler),
}

impl KindedManifest {
    pub fn kind(&self) -> &'static str {
        match self {
            KindedManifest::Deployment(_) => "Deployment",
            KindedManifest::CronJob(_) => "CronJob",
            KindedManifest::Pod(_) => "Pod",
            KindedManifest::ConfigMap(_) => "ConfigMap",
            KindedManifest::Secret(_) => "Secret",
            KindedManifest::HorizontalPodAutoscaler(_) => "HorizontalPodAutoscaler",
        }
    }
}

/// Parse every non-empty `---` separated document. `ns_override` replaces the
/// namespace of each document; documents without one and no override are kept
/// as-is and fail at apply time.
pub fn parse_manifests(yaml: &str, ns_override: Option<&str>) -> Result<Vec<KindedManifest>, ApplyError> {
    if yaml.len() > max_yaml_bytes() {
        return Err(ApplyError::Yaml(format!("payload too large (>{} bytes)", max_yaml_bytes())));
    }
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let val = serde_yaml::Value::deserialize(doc).map_err(|e| ApplyError::Yaml(e.to_string()))?;
        if val.is_null() {
            continue;
        }
        if out.len() >= max_yaml_docs() {
            return Err(ApplyError::Yaml(format!("too many documents (>{})", max_yaml_docs())));
        }
        let mut json = serde_json::to_value(val).map_err(|e| ApplyError::Yaml(e.to_string()))?;
        if let Some(ns) = ns_override {
            if let Some(meta) = json.get_mut("metadata").and_then(Json::as_object_mut) {
                meta.insert("namespace".to_string(), Json::String(ns.to_string()));
            }
        }
        out.push(kinded(json)?);
    }
    Ok(out)
}

fn kinded(json: Json) -> Result<KindedManifest, ApplyError> {
    let kind = json.get("kind").and_then(Json::as_str).ok_or_else(|| ApplyError::Yaml("document missing kind".into()))?.to_string();
    fn de<T: serde::de::DeserializeOwned>(json: Json) -> Result<T, ApplyError> {
        serde_json::from_value(json).map_err(|e| ApplyError::Yaml(e.to_string()))
    }
    Ok(match kind.as_str() {
        "Deployment" => KindedManifest::Deployment(de(json)?),
        "CronJob" => KindedManifest::CronJob(de(json)?),
        "Pod" => KindedManifest::Pod(de(json)?),
        "ConfigMap" => KindedManifest::ConfigMap(de(json)?),
        "Secret" => KindedManifest::Secret(de(json)?),
        "HorizontalPodAutoscaler" => KindedManifest::HorizontalPodAutoscaler(de(json)?),
        _ => return Err(ApplyError::UnsupportedKind(kind)),
    })
}
