//! Client cache policy and the shared cluster reader
//!
//! Reads go through [`ClusterReader`], which serves most kinds from
//! watch-backed local stores and sends the rest straight to the API server.
//! The [`ClientCachePolicy`] decides which is which: secret-like and
//! configmap-like kinds always bypass the local store, so credential rotations
//! and config changes are observed immediately and secrets never sit in
//! operator memory longer than a single request.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::schema::GroupKind;
use crate::{Result, WATCH_TIMEOUT_SECS};

// =============================================================================
// Cache Policy
// =============================================================================

/// Which kinds must never be served from the local read cache
#[derive(Clone, Debug, Default)]
pub struct ClientCachePolicy {
    bypassed: BTreeSet<GroupKind>,
}

impl ClientCachePolicy {
    /// The standard policy: secrets and configmaps bypass the cache
    pub fn standard() -> Self {
        Self::bypassing([GroupKind::of::<Secret>(), GroupKind::of::<ConfigMap>()])
    }

    /// A policy bypassing exactly the given kinds
    pub fn bypassing(kinds: impl IntoIterator<Item = GroupKind>) -> Self {
        Self {
            bypassed: kinds.into_iter().collect(),
        }
    }

    /// Whether reads of this kind must go straight to the API server
    pub fn bypasses(&self, kind: &GroupKind) -> bool {
        self.bypassed.contains(kind)
    }

    /// The bypassed kinds, in group/kind order
    pub fn bypassed(&self) -> impl Iterator<Item = &GroupKind> {
        self.bypassed.iter()
    }
}

// =============================================================================
// Cluster Reader
// =============================================================================

/// A watch-backed store for one cached kind
pub struct CachedStore {
    resource: ApiResource,
    store: Store<DynamicObject>,
}

impl CachedStore {
    /// Pair a store with the resource identity it holds
    pub fn new(resource: ApiResource, store: Store<DynamicObject>) -> Self {
        Self { resource, store }
    }
}

/// Policy-aware read access to the cluster
///
/// Cheap to clone; all clones share the same stores. A kind with a wired
/// store is served from it, a bypassed or unwired kind reads through to the
/// API server. Writes never go through the reader.
#[derive(Clone)]
pub struct ClusterReader {
    client: Client,
    policy: Arc<ClientCachePolicy>,
    stores: Arc<BTreeMap<GroupKind, CachedStore>>,
}

impl ClusterReader {
    /// Build a reader over the given stores
    pub fn new(
        client: Client,
        policy: Arc<ClientCachePolicy>,
        stores: BTreeMap<GroupKind, CachedStore>,
    ) -> Self {
        Self {
            client,
            policy,
            stores: Arc::new(stores),
        }
    }

    /// Fetch one object, from the local store when the policy allows it
    ///
    /// Returns `Ok(None)` when the object does not exist; a miss is a normal
    /// answer, not an error. Pass `namespace: None` for cluster-scoped kinds.
    pub async fn get<K>(&self, name: &str, namespace: Option<&str>) -> Result<Option<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Clone + std::fmt::Debug,
    {
        let key = GroupKind::of::<K>();
        if !self.policy.bypasses(&key) {
            if let Some(cached) = self.stores.get(&key) {
                let mut obj_ref = ObjectRef::new_with(name, cached.resource.clone());
                if let Some(ns) = namespace {
                    obj_ref = obj_ref.within(ns);
                }
                return match cached.store.get(&obj_ref) {
                    Some(obj) => {
                        let value = serde_json::to_value(obj.as_ref())?;
                        Ok(Some(serde_json::from_value(value)?))
                    }
                    None => Ok(None),
                };
            }
        }
        let resource = ApiResource::erase::<K>(&());
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        };
        match api.get_opt(name).await? {
            Some(obj) => {
                let value = serde_json::to_value(&obj)?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    /// Block until every wired store has completed its initial list
    pub(crate) async fn wait_ready(&self) -> std::result::Result<(), ()> {
        for cached in self.stores.values() {
            cached.store.wait_until_ready().await.map_err(|_| ())?;
        }
        Ok(())
    }
}

/// Drive the watch that keeps one cached kind's store current
///
/// Watch errors are logged and retried with backoff; the future ends only on
/// shutdown or when the watch stream is exhausted.
pub(crate) async fn run_reflector(
    client: Client,
    resource: ApiResource,
    writer: Writer<DynamicObject>,
    shutdown: CancellationToken,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client, &resource);
    let stream = watcher(
        api,
        watcher::Config::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .default_backoff()
    .reflect(writer)
    .applied_objects();
    futures::pin_mut!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(kind = %resource.kind, error = %err, "Cache watch error");
                }
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Cluster;
    use k8s_openapi::api::core::v1::Namespace;
    use serde_json::json;

    const NOT_FOUND: &str = r#"{
        "kind": "Status", "apiVersion": "v1", "metadata": {},
        "status": "Failure", "message": "not found",
        "reason": "NotFound", "code": 404
    }"#;

    /// A client whose every request gets the same canned response
    fn canned_client(status: u16, body: &'static str) -> Client {
        let service = tower::service_fn(move |_req: http::Request<kube::client::Body>| async move {
            let response = http::Response::builder()
                .status(status)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(kube::client::Body::from(body.as_bytes().to_vec()))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        });
        Client::new(service, "default")
    }

    fn store_with(ar: &ApiResource, objects: Vec<DynamicObject>) -> CachedStore {
        let mut writer = Writer::new(ar.clone());
        let store = writer.as_reader();
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::Apply(obj));
        }
        // The writer is dropped here; the store keeps serving its contents.
        CachedStore::new(ar.clone(), store)
    }

    #[test]
    fn standard_policy_bypasses_secret_like_and_configmap_like_kinds() {
        let policy = ClientCachePolicy::standard();
        assert!(policy.bypasses(&GroupKind::new("", "Secret")));
        assert!(policy.bypasses(&GroupKind::new("", "ConfigMap")));
        assert!(!policy.bypasses(&GroupKind::new("extensions.arbor.dev", "Cluster")));
        assert!(!policy.bypasses(&GroupKind::new("dns.arbor.dev", "DnsEntry")));
        assert_eq!(policy.bypassed().count(), 2);
    }

    #[tokio::test]
    async fn bypassed_kinds_read_through_even_when_a_store_is_wired() {
        let ar = ApiResource::erase::<Secret>(&());
        let stale = DynamicObject::new("zonelet-provider-credentials", &ar)
            .within("zonelet-system")
            .data(json!({"type": "Opaque"}));
        let cached = store_with(&ar, vec![stale]);
        // Sanity: the store really holds the stale object.
        assert!(cached
            .store
            .get(
                &ObjectRef::new_with("zonelet-provider-credentials", ar.clone())
                    .within("zonelet-system")
            )
            .is_some());

        let mut stores = BTreeMap::new();
        stores.insert(GroupKind::of::<Secret>(), cached);
        let reader = ClusterReader::new(
            canned_client(404, NOT_FOUND),
            Arc::new(ClientCachePolicy::standard()),
            stores,
        );

        // The API server says the secret is gone; the stale store copy must
        // not resurrect it.
        let secret: Option<Secret> = reader
            .get("zonelet-provider-credentials", Some("zonelet-system"))
            .await
            .unwrap();
        assert!(secret.is_none());
    }

    #[tokio::test]
    async fn cached_kinds_are_served_from_the_store() {
        let ar = ApiResource::erase::<Cluster>(&());
        let obj = DynamicObject::new("cluster--dev--one", &ar)
            .data(json!({"spec": {"dnsDomain": "dev-one.arbor.internal", "purpose": "production"}}));
        let mut stores = BTreeMap::new();
        stores.insert(GroupKind::of::<Cluster>(), store_with(&ar, vec![obj]));

        // A 404-everything client proves the read never left the process.
        let reader = ClusterReader::new(
            canned_client(404, NOT_FOUND),
            Arc::new(ClientCachePolicy::standard()),
            stores,
        );

        let cluster: Cluster = reader
            .get("cluster--dev--one", None)
            .await
            .unwrap()
            .expect("served from store");
        assert_eq!(cluster.spec.dns_domain.as_deref(), Some("dev-one.arbor.internal"));
        assert_eq!(cluster.spec.purpose.as_deref(), Some("production"));

        let absent: Option<Cluster> = reader.get("no-such-cluster", None).await.unwrap();
        assert!(absent.is_none(), "store miss is a plain None, not an error");
    }

    #[tokio::test]
    async fn unwired_kinds_fall_back_to_direct_reads() {
        let body = r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "zonelet-system"}}"#;
        let reader = ClusterReader::new(
            canned_client(200, body),
            Arc::new(ClientCachePolicy::standard()),
            BTreeMap::new(),
        );
        let ns: Namespace = reader
            .get("zonelet-system", None)
            .await
            .unwrap()
            .expect("direct read");
        assert_eq!(ns.metadata.name.as_deref(), Some("zonelet-system"));
    }
}
