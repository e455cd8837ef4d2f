use std::collections::BTreeMap;

use drydock_apply::Applier;
use drydock_core::{EnvBinding, ResourceKind, ResourceRef, WorkloadKind, WorkloadSpec};
use drydock_kubehub::memory::{MemoryStores, Op};
use drydock_ops::{apply_patch, Mutation, PatchError};
use k8s_openapi::api::core::v1::{EnvVar, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn web() -> WorkloadSpec {
    WorkloadSpec::new("dev", "web", WorkloadKind::Deployment { replicas: Some(2) }, "nginx")
        .with_env(EnvBinding::literal("KEEP", "yes"))
}

fn deploy_ref() -> ResourceRef {
    ResourceRef::new(ResourceKind::Deployment, "dev", "web")
}

fn env_of(mem: &MemoryStores) -> BTreeMap<String, String> {
    let d = mem.deployments.snapshot("dev", "web").unwrap();
    let containers = d.spec.unwrap().template.spec.unwrap().containers;
    assert_eq!(containers.len(), 1);
    containers[0]
        .env
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|EnvVar { name, value, .. }| (name, value.unwrap_or_default()))
        .collect()
}

async fn seeded() -> MemoryStores {
    let mem = MemoryStores::new();
    Applier::new(&mem.stores()).apply_workload(&web()).await.unwrap();
    mem
}

#[tokio::test]
async fn env_set_then_unset_round_trips() {
    let mem = seeded().await;
    let stores = mem.stores();

    let set = Mutation::SetEnv { container: "web".into(), vars: vec![("K1".into(), "V1".into()), ("K2".into(), "V2".into())] };
    let payload = apply_patch(&stores, &deploy_ref(), &set).await.unwrap();
    assert!(payload.stamped_at.is_some());
    let expected: BTreeMap<_, _> = [("KEEP", "yes"), ("K1", "V1"), ("K2", "V2")].into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    assert_eq!(env_of(&mem), expected);

    let unset = Mutation::UnsetEnv { container: "web".into(), names: vec!["K1".into()] };
    apply_patch(&stores, &deploy_ref(), &unset).await.unwrap();
    let expected: BTreeMap<_, _> = [("KEEP", "yes"), ("K2", "V2")].into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    assert_eq!(env_of(&mem), expected);

    let d = mem.deployments.snapshot("dev", "web").unwrap();
    let annotations = d.metadata.annotations.unwrap_or_default();
    assert_eq!(annotations.get("kubernetes.io/change-cause").map(String::as_str), Some("update env vars"));
    let template_annotations = d.spec.unwrap().template.metadata.unwrap().annotations.unwrap_or_default();
    assert!(template_annotations.contains_key("date"));
}

#[tokio::test]
async fn env_patch_leaves_other_fields_alone() {
    let mem = seeded().await;
    let before = mem.deployments.snapshot("dev", "web").unwrap();

    let set = Mutation::SetEnv { container: "web".into(), vars: vec![("K1".into(), "V1".into())] };
    apply_patch(&mem.stores(), &deploy_ref(), &set).await.unwrap();

    let after = mem.deployments.snapshot("dev", "web").unwrap();
    let (b, a) = (before.spec.unwrap(), after.spec.unwrap());
    assert_eq!(a.replicas, b.replicas);
    assert_eq!(a.selector, b.selector);
    let (bc, ac) = (&b.template.spec.as_ref().unwrap().containers[0], &a.template.spec.as_ref().unwrap().containers[0]);
    assert_eq!(ac.image, bc.image);
    assert_eq!(ac.name, bc.name);
}

#[tokio::test]
async fn scale_and_annotations_reach_the_store() {
    let mem = seeded().await;
    let stores = mem.stores();
    apply_patch(&stores, &deploy_ref(), &Mutation::Scale(5)).await.unwrap();
    assert_eq!(mem.deployments.snapshot("dev", "web").unwrap().spec.unwrap().replicas, Some(5));

    mem.services.insert(Service {
        metadata: ObjectMeta {
            name: Some("web".into()),
            namespace: Some("dev".into()),
            annotations: Some(BTreeMap::from([("old".to_string(), "x".to_string())])),
            ..Default::default()
        },
        ..Default::default()
    });
    let svc = ResourceRef::new(ResourceKind::Service, "dev", "web");
    let map = BTreeMap::from([("lb".to_string(), "internal".to_string())]);
    apply_patch(&stores, &svc, &Mutation::Annotations(map)).await.unwrap();
    let annotations = mem.services.snapshot("dev", "web").unwrap().metadata.annotations.unwrap();
    assert_eq!(annotations, BTreeMap::from([("lb".to_string(), "internal".to_string())]));
}

#[tokio::test]
async fn rollback_is_rejected_rather_than_dropped() {
    let mem = seeded().await;
    let before = mem.deployments.snapshot("dev", "web").unwrap();
    let err = apply_patch(&mem.stores(), &deploy_ref(), &Mutation::Rollback("3".into())).await.unwrap_err();
    assert!(matches!(err, PatchError::Apply { ref source, .. } if source.code() == Some(400)), "{err}");
    assert!(err.to_string().contains("rollbackTo"), "{err}");
    assert_eq!(mem.deployments.calls(Op::Patch), 1);
    assert_eq!(mem.deployments.snapshot("dev", "web").unwrap().spec, before.spec);
}

#[tokio::test]
async fn store_failures_are_wrapped_with_kind() {
    let mem = seeded().await;
    mem.deployments.fail_next(Op::Patch, 403, "Forbidden");
    let err = apply_patch(&mem.stores(), &deploy_ref(), &Mutation::Scale(1)).await.unwrap_err();
    assert!(matches!(err, PatchError::Apply { kind: ResourceKind::Deployment, .. }));
    assert!(!err.is_caller_error());
    assert!(err.to_string().starts_with("patch deploy failed"));

    let missing = ResourceRef::new(ResourceKind::Deployment, "dev", "nope");
    let err = apply_patch(&mem.stores(), &missing, &Mutation::Scale(1)).await.unwrap_err();
    assert!(matches!(err, PatchError::Apply { ref source, .. } if source.is_not_found()));
}

#[tokio::test]
async fn invalid_mutations_never_reach_the_store() {
    let mem = seeded().await;
    let err = apply_patch(&mem.stores(), &deploy_ref(), &Mutation::Rollback("latest".into())).await.unwrap_err();
    assert!(err.is_caller_error());
    assert_eq!(mem.deployments.calls(Op::Patch), 0);
}
