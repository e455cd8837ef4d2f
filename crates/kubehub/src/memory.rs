//! In-memory store and log source with API-server-like semantics.
//!
//! Updates keep the stored `status` (status is a subresource), patches follow strategic
//! merge rules for named lists, and failures can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{stream, StreamExt};
use serde_json::Value as Json;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};

use crate::{identity, kind_of, ByteStream, LogOptions, LogSource, Manifested, ResourceStore, StoreError, Stores};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    Patch,
    Delete,
    List,
}

#[derive(Debug, Clone)]
struct Fault {
    op: Op,
    code: u16,
    reason: String,
}

pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl<K: Manifested> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Manifested> MemoryStore<K> {
    pub fn new() -> Self {
        Self { objects: Mutex::new(BTreeMap::new()), faults: Mutex::new(Vec::new()), calls: Mutex::new(HashMap::new()) }
    }

    /// Seed an object directly, bypassing faults and counters.
    pub fn insert(&self, obj: K) {
        if let Ok((ns, name)) = identity(&obj) {
            self.objects.lock().unwrap().insert((ns, name), obj);
        }
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.snapshot(namespace, name).is_some()
    }

    /// Mutate a stored object in place, as an external controller would.
    pub fn modify(&self, namespace: &str, name: &str, f: impl FnOnce(&mut K)) -> bool {
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&(namespace.to_string(), name.to_string())) {
            Some(obj) => {
                f(obj);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next call of `op` fails with the given API status.
    pub fn fail_next(&self, op: Op, code: u16, reason: &str) {
        self.faults.lock().unwrap().push(Fault { op, code, reason: reason.to_string() });
    }

    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: Op, namespace: &str, name: &str) -> Result<(), StoreError> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        let mut faults = self.faults.lock().unwrap();
        if let Some(pos) = faults.iter().position(|f| f.op == op) {
            let f = faults.remove(pos);
            return Err(StoreError::api(f.code, &f.reason, "injected", &kind_of::<K>(), namespace, name));
        }
        Ok(())
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound { kind: kind_of::<K>(), namespace: namespace.to_string(), name: name.to_string() }
    }
}

#[async_trait::async_trait]
impl<K: Manifested> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.enter(Op::Get, namespace, name)?;
        self.snapshot(namespace, name).ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = identity(obj)?;
        self.enter(Op::Create, &ns, &name)?;
        let mut objects = self.objects.lock().unwrap();
        let key = (ns.clone(), name.clone());
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists { kind: kind_of::<K>(), namespace: ns, name });
        }
        objects.insert(key, obj.clone());
        Ok(obj.clone())
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = identity(obj)?;
        self.enter(Op::Update, &ns, &name)?;
        let mut objects = self.objects.lock().unwrap();
        let key = (ns.clone(), name.clone());
        let live = objects.get(&key).ok_or_else(|| Self::not_found(&ns, &name))?;
        let mut next = serde_json::to_value(obj)?;
        let live_json = serde_json::to_value(live)?;
        if let (Some(status), Some(map)) = (live_json.get("status"), next.as_object_mut()) {
            map.insert("status".to_string(), status.clone());
        }
        let next: K = serde_json::from_value(next)?;
        objects.insert(key, next.clone());
        Ok(next)
    }

    async fn patch(&self, namespace: &str, name: &str, body: &Json) -> Result<K, StoreError> {
        self.enter(Op::Patch, namespace, name)?;
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let live = objects.get(&key).ok_or_else(|| Self::not_found(namespace, name))?;
        let mut doc = serde_json::to_value(live)?;
        strategic_merge(&mut doc, body);
        let next: K = serde_json::from_value(doc.clone())?;
        // strict field validation: the server rejects fields the schema does not know
        if let Some(field) = unknown_field(&doc, &serde_json::to_value(&next)?, String::new()) {
            let message = format!("strict decoding error: unknown field \"{field}\"");
            return Err(StoreError::api(400, "BadRequest", &message, &kind_of::<K>(), namespace, name));
        }
        objects.insert(key, next.clone());
        Ok(next)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.enter(Op::Delete, namespace, name)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(namespace, name))
    }

    async fn list(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.enter(Op::List, namespace, "")?;
        let wanted: Vec<(&str, Option<&str>)> = label_selector
            .map(|sel| {
                sel.split(',')
                    .filter(|t| !t.is_empty())
                    .map(|t| match t.split_once('=') {
                        Some((k, v)) => (k.trim(), Some(v.trim())),
                        None => (t.trim(), None),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| {
                let labels = obj.meta().labels.clone().unwrap_or_default();
                wanted.iter().all(|(k, v)| match v {
                    Some(v) => labels.get(*k).map(String::as_str) == Some(*v),
                    None => labels.contains_key(*k),
                })
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

/// Typed handles on a full set of in-memory stores.
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub deployments: Arc<MemoryStore<Deployment>>,
    pub cron_jobs: Arc<MemoryStore<CronJob>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub config_maps: Arc<MemoryStore<ConfigMap>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub autoscalers: Arc<MemoryStore<HorizontalPodAutoscaler>>,
    pub services: Arc<MemoryStore<Service>>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stores(&self) -> Stores {
        Stores {
            deployments: self.deployments.clone(),
            cron_jobs: self.cron_jobs.clone(),
            pods: self.pods.clone(),
            config_maps: self.config_maps.clone(),
            secrets: self.secrets.clone(),
            autoscalers: self.autoscalers.clone(),
            services: self.services.clone(),
        }
    }
}

/// First path present in `sent` but dropped by the typed round trip in `kept`.
fn unknown_field(sent: &Json, kept: &Json, path: String) -> Option<String> {
    let (Json::Object(sent), Json::Object(kept)) = (sent, kept) else { return None };
    sent.iter().find_map(|(k, v)| {
        let at = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
        match kept.get(k) {
            None => Some(at),
            Some(kv) => unknown_field(v, kv, at),
        }
    })
}

/// Apply `patch` onto `target` with strategic-merge semantics:
/// objects merge recursively, `null` removes a key, an object carrying
/// `"$patch": "replace"` replaces the target wholesale, lists whose items all carry a
/// `name` merge by that name (an item with `"$patch": "delete"` removes the match),
/// any other value replaces.
pub fn strategic_merge(target: &mut Json, patch: &Json) {
    match (target, patch) {
        (t, Json::Object(p)) if p.get("$patch").and_then(Json::as_str) == Some("replace") => {
            let mut p = p.clone();
            p.remove("$patch");
            *t = Json::Object(p);
        }
        (Json::Object(t), Json::Object(p)) => {
            for (k, pv) in p {
                if pv.is_null() {
                    t.remove(k);
                    continue;
                }
                match t.get_mut(k) {
                    Some(tv) => strategic_merge(tv, pv),
                    None => {
                        let mut fresh = empty_like(pv);
                        strategic_merge(&mut fresh, pv);
                        t.insert(k.clone(), fresh);
                    }
                }
            }
        }
        (Json::Array(t), Json::Array(p)) if is_named_list(p) && t.iter().all(|v| v.get("name").is_some()) => {
            for item in p {
                let name = item.get("name").cloned();
                let pos = t.iter().position(|v| v.get("name") == name.as_ref());
                let delete = item.get("$patch").and_then(Json::as_str) == Some("delete");
                match (pos, delete) {
                    (Some(i), true) => {
                        t.remove(i);
                    }
                    (None, true) => {}
                    (Some(i), false) => strategic_merge(&mut t[i], item),
                    (None, false) => {
                        let mut fresh = Json::Object(serde_json::Map::new());
                        strategic_merge(&mut fresh, item);
                        t.push(fresh);
                    }
                }
            }
        }
        (t, p) => {
            if let Json::Array(items) = p {
                if is_named_list(items) {
                    let mut fresh = Json::Array(Vec::new());
                    strategic_merge(&mut fresh, p);
                    *t = fresh;
                    return;
                }
            }
            *t = p.clone();
        }
    }
}

fn empty_like(v: &Json) -> Json {
    match v {
        Json::Object(_) => Json::Object(serde_json::Map::new()),
        Json::Array(_) => Json::Array(Vec::new()),
        other => other.clone(),
    }
}

fn is_named_list(items: &[Json]) -> bool {
    !items.is_empty() && items.iter().all(|v| v.get("name").and_then(Json::as_str).is_some())
}

enum LogFeed {
    Chunks(Vec<Bytes>),
    Live(Option<ByteStream>),
}

/// Log source backed by canned chunks or a caller-provided live stream.
#[derive(Default)]
pub struct MemoryLogs {
    feeds: Mutex<HashMap<(String, String), LogFeed>>,
    opened: Mutex<Vec<(String, LogOptions)>>,
}

impl MemoryLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, namespace: &str, pod: &str, chunk: impl Into<Bytes>) {
        let mut feeds = self.feeds.lock().unwrap();
        let feed = feeds.entry((namespace.to_string(), pod.to_string())).or_insert_with(|| LogFeed::Chunks(Vec::new()));
        if let LogFeed::Chunks(chunks) = feed {
            chunks.push(chunk.into());
        }
    }

    /// Serve `stream` to the first opener of this pod's logs.
    pub fn live(&self, namespace: &str, pod: &str, stream: ByteStream) {
        self.feeds.lock().unwrap().insert((namespace.to_string(), pod.to_string()), LogFeed::Live(Some(stream)));
    }

    /// Pods whose logs were opened, with the options used.
    pub fn opened(&self) -> Vec<(String, LogOptions)> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LogSource for MemoryLogs {
    async fn open_logs(&self, namespace: &str, pod: &str, opts: &LogOptions) -> Result<ByteStream, StoreError> {
        self.opened.lock().unwrap().push((pod.to_string(), opts.clone()));
        let mut feeds = self.feeds.lock().unwrap();
        match feeds.get_mut(&(namespace.to_string(), pod.to_string())) {
            Some(LogFeed::Chunks(chunks)) => Ok(stream::iter(chunks.clone().into_iter().map(Ok)).boxed()),
            Some(LogFeed::Live(s)) => Ok(s.take().unwrap_or_else(|| stream::empty().boxed())),
            None => Err(StoreError::NotFound { kind: "Pod".to_string(), namespace: namespace.to_string(), name: pod.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use serde_json::json;

    fn deploy(ns: &str, name: &str) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": ns, "labels": {"app": name}},
            "spec": {
                "selector": {"matchLabels": {"app": name}},
                "template": {"spec": {"containers": [{"name": name, "image": "nginx", "env": [{"name": "A", "value": "1"}]}]}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn merge_named_lists_by_name_and_honors_delete_directive() {
        let mut doc = json!({"env": [{"name": "A", "value": "1"}, {"name": "B", "value": "2"}]});
        strategic_merge(&mut doc, &json!({"env": [{"name": "B", "value": "3"}, {"name": "C", "value": "4"}]}));
        assert_eq!(doc, json!({"env": [{"name": "A", "value": "1"}, {"name": "B", "value": "3"}, {"name": "C", "value": "4"}]}));

        strategic_merge(&mut doc, &json!({"env": [{"name": "A", "$patch": "delete"}, {"name": "Z", "$patch": "delete"}]}));
        assert_eq!(doc, json!({"env": [{"name": "B", "value": "3"}, {"name": "C", "value": "4"}]}));
    }

    #[test]
    fn merge_null_removes_and_scalars_replace() {
        let mut doc = json!({"a": 1, "b": {"c": 2, "d": 3}, "l": [1, 2]});
        strategic_merge(&mut doc, &json!({"a": null, "b": {"c": 9}, "l": [3]}));
        assert_eq!(doc, json!({"b": {"c": 9, "d": 3}, "l": [3]}));
    }

    #[test]
    fn replace_directive_drops_unlisted_keys() {
        let mut doc = json!({"metadata": {"name": "web", "annotations": {"old": "x", "lb": "public"}}});
        strategic_merge(&mut doc, &json!({"metadata": {"annotations": {"lb": "internal", "$patch": "replace"}}}));
        assert_eq!(doc, json!({"metadata": {"name": "web", "annotations": {"lb": "internal"}}}));

        let mut doc = json!({});
        strategic_merge(&mut doc, &json!({"annotations": {"a": "1", "$patch": "replace"}}));
        assert_eq!(doc, json!({"annotations": {"a": "1"}}));
    }

    #[tokio::test]
    async fn patch_rejects_fields_the_schema_drops() {
        let store = MemoryStore::<Deployment>::new();
        store.insert(deploy("ns", "web"));
        let err = store.patch("ns", "web", &json!({"spec": {"rollbackTo": {"revision": 3}}})).await.unwrap_err();
        assert_eq!(err.code(), Some(400));
        assert!(err.to_string().contains("spec.rollbackTo"), "{err}");

        let out = store.patch("ns", "web", &json!({"spec": {"replicas": 3}})).await.unwrap();
        assert_eq!(out.spec.and_then(|s| s.replicas), Some(3));
    }

    #[test]
    fn merge_into_absent_list_drops_delete_markers() {
        let mut doc = json!({});
        strategic_merge(&mut doc, &json!({"env": [{"name": "A", "$patch": "delete"}, {"name": "B", "value": "2"}]}));
        assert_eq!(doc, json!({"env": [{"name": "B", "value": "2"}]}));
    }

    #[tokio::test]
    async fn update_keeps_status_and_missing_object_is_not_found() {
        let store = MemoryStore::<Deployment>::new();
        let d = deploy("ns", "web");
        assert!(store.update(&d).await.unwrap_err().is_not_found());

        let mut live = d.clone();
        live.status = Some(k8s_openapi::api::apps::v1::DeploymentStatus { replicas: Some(4), ..Default::default() });
        store.insert(live);
        let out = store.update(&d).await.unwrap();
        assert_eq!(out.status.and_then(|s| s.replicas), Some(4));
        assert_eq!(store.calls(Op::Update), 2);
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_faults_fire_once() {
        let store = MemoryStore::<Deployment>::new();
        store.fail_next(Op::Create, 403, "Forbidden");
        let err = store.create(&deploy("ns", "web")).await.unwrap_err();
        assert_eq!(err.code(), Some(403));
        store.create(&deploy("ns", "web")).await.unwrap();
        assert!(store.create(&deploy("ns", "web")).await.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_labels() {
        let store = MemoryStore::<Deployment>::new();
        store.insert(deploy("ns", "a"));
        store.insert(deploy("ns", "b"));
        store.insert(deploy("other", "a"));
        assert_eq!(store.list("ns", None).await.unwrap().len(), 2);
        assert_eq!(store.list("ns", Some("app=b")).await.unwrap().len(), 1);
        assert_eq!(store.list("ns", Some("app")).await.unwrap().len(), 2);
        assert_eq!(store.list("ns", Some("tier=web")).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn memory_logs_serve_chunks_and_live_streams() {
        let logs = MemoryLogs::new();
        logs.push("ns", "p", "hello\n");
        let s = logs.open_logs("ns", "p", &LogOptions::default()).await.unwrap();
        let got: Vec<_> = s.collect().await;
        assert_eq!(got.len(), 1);

        logs.live("ns", "q", stream::iter(vec![Ok(Bytes::from_static(b"x"))]).boxed());
        let s = logs.open_logs("ns", "q", &LogOptions::default()).await.unwrap();
        assert_eq!(s.collect::<Vec<_>>().await.len(), 1);
        assert!(logs.open_logs("ns", "missing", &LogOptions::default()).await.err().unwrap().is_not_found());
    }
}
