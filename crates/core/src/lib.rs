//! drydock core types: workload specs and resource identity.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod manifest;

pub use manifest::Manifest;

/// Kinds of resources drydock reads or mutates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Deployment,
    CronJob,
    Pod,
    ConfigMap,
    Secret,
    HorizontalPodAutoscaler,
    Service,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "deploy",
            ResourceKind::CronJob => "cronjob",
            ResourceKind::Pod => "pod",
            ResourceKind::ConfigMap => "configmap",
            ResourceKind::Secret => "secret",
            ResourceKind::HorizontalPodAutoscaler => "hpa",
            ResourceKind::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deploy" | "deployment" | "deployments" => Ok(ResourceKind::Deployment),
            "cronjob" | "cronjobs" | "cj" => Ok(ResourceKind::CronJob),
            "pod" | "pods" | "po" => Ok(ResourceKind::Pod),
            "configmap" | "configmaps" | "cm" => Ok(ResourceKind::ConfigMap),
            "secret" | "secrets" => Ok(ResourceKind::Secret),
            "hpa" | "horizontalpodautoscaler" => Ok(ResourceKind::HorizontalPodAutoscaler),
            "service" | "services" | "svc" => Ok(ResourceKind::Service),
            other => Err(SpecError::UnknownKind(other.to_string())),
        }
    }
}

/// Control-plane identity of a namespaced resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Where an environment variable gets its value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnvSource {
    Literal(String),
    /// Indirect reference to one key of a secret.
    Secret { secret: String, key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvBinding {
    pub name: String,
    pub source: EnvSource,
}

impl EnvBinding {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), source: EnvSource::Literal(value.into()) }
    }

    pub fn from_secret(name: impl Into<String>, secret: impl Into<String>, key: impl Into<String>) -> Self {
        Self { name: name.into(), source: EnvSource::Secret { secret: secret.into(), key: key.into() } }
    }
}

/// Parse `KEY=VALUE` into a literal binding. The value may contain `=`.
impl FromStr for EnvBinding {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok(EnvBinding::literal(k, v)),
            _ => Err(SpecError::InvalidBinding(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkloadKind {
    /// Long-running workload. `replicas: None` keeps whatever the cluster runs now.
    Deployment { replicas: Option<i32> },
    CronJob { schedule: String },
    /// Run-to-completion pod.
    Pod,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvBinding>,
    /// Resource name (`cpu`, `memory`, ...) to quantity string.
    pub limits: BTreeMap<String, String>,
    pub requests: BTreeMap<String, String>,
}

/// Immutable description of a workload to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub namespace: String,
    pub name: String,
    pub kind: WorkloadKind,
    pub container: ContainerSpec,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl WorkloadSpec {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: WorkloadKind, image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            kind,
            container: ContainerSpec { image: image.into(), ..Default::default() },
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self::new(namespace, name, WorkloadKind::Pod, image)
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.container.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, binding: EnvBinding) -> Self {
        self.container.env.push(binding);
        self
    }

    pub fn resource_kind(&self) -> ResourceKind {
        match self.kind {
            WorkloadKind::Deployment { .. } => ResourceKind::Deployment,
            WorkloadKind::CronJob { .. } => ResourceKind::CronJob,
            WorkloadKind::Pod => ResourceKind::Pod,
        }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.resource_kind(), self.namespace.clone(), self.name.clone())
    }
}

/// Invalid caller input, detected before anything is sent to the cluster.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
    #[error("invalid env binding {0:?} (expect KEY=VALUE)")]
    InvalidBinding(String),
    #[error("workload name and namespace must not be empty")]
    MissingIdentity,
    #[error("workload {0} has no container image")]
    MissingImage(String),
    #[error("empty quantity for resource {0}")]
    EmptyQuantity(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_aliases_parse() {
        assert_eq!("deployment".parse::<ResourceKind>().unwrap(), ResourceKind::Deployment);
        assert_eq!("CJ".parse::<ResourceKind>().unwrap(), ResourceKind::CronJob);
        assert_eq!("svc".parse::<ResourceKind>().unwrap(), ResourceKind::Service);
        assert!("widget".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn binding_parse_keeps_equals_in_value() {
        let b: EnvBinding = "DSN=postgres://u:p@h/db?a=b".parse().unwrap();
        assert_eq!(b, EnvBinding::literal("DSN", "postgres://u:p@h/db?a=b"));
        assert!("=oops".parse::<EnvBinding>().is_err());
        assert!("novalue".parse::<EnvBinding>().is_err());
    }

    #[test]
    fn reference_follows_kind() {
        let spec = WorkloadSpec::new("ns", "web", WorkloadKind::Deployment { replicas: None }, "nginx");
        assert_eq!(spec.reference().to_string(), "deploy ns/web");
    }
}
