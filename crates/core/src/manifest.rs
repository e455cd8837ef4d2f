//! Minimal translation of a [`WorkloadSpec`] into typed manifests.
//!
//! The container is always named after the workload; env patches address it by that name.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Pod, PodSpec, PodTemplateSpec, ResourceRequirements, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::{ContainerSpec, EnvBinding, EnvSource, SpecError, WorkloadKind, WorkloadSpec};

/// Label every drydock workload carries; Deployments select on it.
pub const APP_LABEL: &str = "app";

#[derive(Debug, Clone)]
pub enum Manifest {
    Deployment(Deployment),
    CronJob(CronJob),
    Pod(Pod),
}

impl WorkloadSpec {
    pub fn to_manifest(&self) -> Result<Manifest, SpecError> {
        match &self.kind {
            WorkloadKind::Deployment { .. } => to_deployment(self).map(Manifest::Deployment),
            WorkloadKind::CronJob { .. } => to_cron_job(self).map(Manifest::CronJob),
            WorkloadKind::Pod => to_pod(self).map(Manifest::Pod),
        }
    }
}

pub fn to_deployment(spec: &WorkloadSpec) -> Result<Deployment, SpecError> {
    validate(spec)?;
    let replicas = match spec.kind {
        WorkloadKind::Deployment { replicas } => replicas,
        _ => None,
    };
    let labels = labels(spec);
    Ok(Deployment {
        metadata: metadata(spec, &labels),
        spec: Some(DeploymentSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), spec.name.clone())])),
                ..Default::default()
            },
            template: template(spec, &labels, None)?,
            ..Default::default()
        }),
        status: None,
    })
}

pub fn to_cron_job(spec: &WorkloadSpec) -> Result<CronJob, SpecError> {
    validate(spec)?;
    let schedule = match &spec.kind {
        WorkloadKind::CronJob { schedule } => schedule.clone(),
        _ => String::new(),
    };
    let labels = labels(spec);
    Ok(CronJob {
        metadata: metadata(spec, &labels),
        spec: Some(CronJobSpec {
            schedule,
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    template: template(spec, &labels, Some("OnFailure"))?,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

pub fn to_pod(spec: &WorkloadSpec) -> Result<Pod, SpecError> {
    validate(spec)?;
    let labels = labels(spec);
    Ok(Pod {
        metadata: metadata(spec, &labels),
        spec: Some(pod_spec(spec, Some("Never"))?),
        status: None,
    })
}

fn validate(spec: &WorkloadSpec) -> Result<(), SpecError> {
    if spec.name.is_empty() || spec.namespace.is_empty() {
        return Err(SpecError::MissingIdentity);
    }
    if spec.container.image.is_empty() {
        return Err(SpecError::MissingImage(spec.name.clone()));
    }
    Ok(())
}

fn labels(spec: &WorkloadSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.insert(APP_LABEL.to_string(), spec.name.clone());
    labels
}

fn metadata(spec: &WorkloadSpec, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(spec.name.clone()),
        namespace: Some(spec.namespace.clone()),
        labels: Some(labels.clone()),
        annotations: if spec.annotations.is_empty() { None } else { Some(spec.annotations.clone()) },
        ..Default::default()
    }
}

fn template(spec: &WorkloadSpec, labels: &BTreeMap<String, String>, restart: Option<&str>) -> Result<PodTemplateSpec, SpecError> {
    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels.clone()), ..Default::default() }),
        spec: Some(pod_spec(spec, restart)?),
    })
}

fn pod_spec(spec: &WorkloadSpec, restart: Option<&str>) -> Result<PodSpec, SpecError> {
    Ok(PodSpec {
        containers: vec![container(&spec.name, &spec.container)?],
        restart_policy: restart.map(str::to_string),
        ..Default::default()
    })
}

fn container(name: &str, c: &ContainerSpec) -> Result<Container, SpecError> {
    let limits = quantities(&c.limits)?;
    let requests = quantities(&c.requests)?;
    let resources = if limits.is_none() && requests.is_none() {
        None
    } else {
        Some(ResourceRequirements { limits, requests, ..Default::default() })
    };
    Ok(Container {
        name: name.to_string(),
        image: Some(c.image.clone()),
        command: if c.command.is_empty() { None } else { Some(c.command.clone()) },
        args: if c.args.is_empty() { None } else { Some(c.args.clone()) },
        env: if c.env.is_empty() { None } else { Some(c.env.iter().map(env_var).collect()) },
        resources,
        ..Default::default()
    })
}

pub fn env_var(b: &EnvBinding) -> EnvVar {
    match &b.source {
        EnvSource::Literal(v) => EnvVar { name: b.name.clone(), value: Some(v.clone()), value_from: None },
        EnvSource::Secret { secret, key } => EnvVar {
            name: b.name.clone(),
            value: None,
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector { key: key.clone(), name: Some(secret.clone()), ..Default::default() }),
                ..Default::default()
            }),
        },
    }
}

fn quantities(src: &BTreeMap<String, String>) -> Result<Option<BTreeMap<String, Quantity>>, SpecError> {
    if src.is_empty() {
        return Ok(None);
    }
    let mut out = BTreeMap::new();
    for (resource, q) in src {
        if q.trim().is_empty() {
            return Err(SpecError::EmptyQuantity(resource.clone()));
        }
        out.insert(resource.clone(), Quantity(q.trim().to_string()));
    }
    Ok(Some(out))
}
