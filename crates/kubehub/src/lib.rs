//! Podtick kubehub: GVK resolution, the kube-backed object store and controller wiring

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use podtick_core::{MetaPatch, Metadata, ObjectKey, Snapshot};
use podtick_reconciler::{ObjectStore, StoreError};
use serde_json::{json, Map, Value as Json};
use tracing::debug;

mod controller;

pub use controller::{run_controller, Backoff, ControllerSettings};

/// Field manager recorded on every patch this process sends.
pub const FIELD_MANAGER: &str = "podtick";

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig/in-cluster env")
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK against the server's discovery data. Returns the resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Object store over the Kubernetes API for one resource type.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeStore {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }

    /// Resolve `gvk_key` (e.g. "v1/Pod") and build a store for it.
    pub async fn for_gvk(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        Ok(Self::new(client, ar, namespaced))
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.ar
    }

    pub fn namespaced(&self) -> bool {
        self.namespaced
    }

    /// Api handle scoped to `namespace` (ignored for cluster-scoped kinds).
    pub fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Snapshot, StoreError> {
        let api = self.api(key.namespace.as_deref());
        match api.get_opt(&key.name).await {
            Ok(Some(obj)) => Ok(snapshot_from(key.clone(), &obj)),
            Ok(None) => Err(StoreError::NotFound),
            Err(e) => Err(classify(e)),
        }
    }

    async fn update(&self, base: &Snapshot, patch: &MetaPatch) -> Result<(), StoreError> {
        let api = self.api(base.key.namespace.as_deref());
        let body = merge_patch_body(base.resource_version.as_deref(), patch);
        debug!(obj = %base.key, patch = %body, "patching metadata");
        let pp = PatchParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        api.patch(&base.key.name, &pp, &Patch::Merge(&body)).await.map_err(classify)?;
        Ok(())
    }
}

/// JSON merge patch touching only the changed labels/annotations. Carrying
/// `resourceVersion` makes the API server reject it with 409 if the object moved on.
pub fn merge_patch_body(resource_version: Option<&str>, patch: &MetaPatch) -> Json {
    fn section(changes: &BTreeMap<String, Option<String>>) -> Json {
        let map: Map<String, Json> = changes
            .iter()
            .map(|(k, v)| (k.clone(), v.as_ref().map(|s| Json::String(s.clone())).unwrap_or(Json::Null)))
            .collect();
        Json::Object(map)
    }
    let mut meta = Map::new();
    if let Some(rv) = resource_version {
        meta.insert("resourceVersion".into(), json!(rv));
    }
    if !patch.labels.is_empty() {
        meta.insert("labels".into(), section(&patch.labels));
    }
    if !patch.annotations.is_empty() {
        meta.insert("annotations".into(), section(&patch.annotations));
    }
    json!({ "metadata": meta })
}

/// Map kube client errors onto the store taxonomy.
pub fn classify(e: kube::Error) -> StoreError {
    if let kube::Error::Api(resp) = &e {
        match resp.code {
            404 => return StoreError::NotFound,
            409 => return StoreError::Conflict,
            _ => {}
        }
    }
    StoreError::Unavailable(anyhow::Error::new(e))
}

pub fn object_key(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.as_deref()?;
    Some(ObjectKey::new(obj.metadata.namespace.as_deref(), name))
}

pub fn snapshot_from(key: ObjectKey, obj: &DynamicObject) -> Snapshot {
    Snapshot {
        key,
        resource_version: obj.metadata.resource_version.clone(),
        meta: Metadata {
            labels: obj.metadata.labels.clone().unwrap_or_default(),
            annotations: obj.metadata.annotations.clone().unwrap_or_default(),
        },
    }
}

/// Parse a raw `{"metadata": {...}}` document into a snapshot (used by offline evaluation).
pub fn snapshot_from_json(raw: &Json) -> Result<Snapshot> {
    let obj: DynamicObject = serde_json::from_value(raw.clone()).context("parsing object json")?;
    let key = object_key(&obj).ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok(snapshot_from(key, &obj))
}
