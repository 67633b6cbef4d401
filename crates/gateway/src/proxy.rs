//! Proxy selection: maps a call path to a backend through discovery, with a
//! per-service cache that honors instance leases.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use proto::{Frame, GatewayError, Status};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::business::Business;
use crate::client::BackendClient;
use crate::discovery::{Discovery, Instance};
use crate::router::{CallCtx, CallHandler};
use crate::session::Session;

/// Metadata keys attached to forwarded calls.
pub const META_SESSION_ID: &str = "x-session-id";
pub const META_AUTH_INFO: &str = "x-auth-info";

/// Backend chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub service: String,
    pub addr: String,
}

struct CacheEntry {
    target: ProxyTarget,
    /// Earliest lease among the resolved instances; `None` when all are
    /// permanent.
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

pub struct ProxySelector {
    discovery: Arc<dyn Discovery>,
    business: Arc<dyn Business>,
    cache: DashMap<String, CacheEntry>,
}

impl ProxySelector {
    pub fn new(discovery: Arc<dyn Discovery>, business: Arc<dyn Business>) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            business,
            cache: DashMap::new(),
        })
    }

    /// Service name of a call path: its first non-empty segment.
    pub fn service_of(path: &str) -> Option<&str> {
        path.split('/').find(|segment| !segment.is_empty())
    }

    /// Resolves the backend that serves `path`.
    pub async fn resolve(
        &self,
        path: &str,
        session: Option<&Session>,
    ) -> Result<ProxyTarget, GatewayError> {
        let service = Self::service_of(path).ok_or_else(|| GatewayError::ProxyResolution {
            service: path.to_string(),
            reason: "path names no service".into(),
        })?;

        let now = Instant::now();
        if let Some(entry) = self.cache.get(service) {
            if entry.is_fresh(now) {
                return Ok(entry.target.clone());
            }
        }
        self.cache.remove(service);

        let instances = self.discovery.resolve(service).await.map_err(|e| {
            GatewayError::ProxyResolution {
                service: service.to_string(),
                reason: e.to_string(),
            }
        })?;
        let expires_at = instances.iter().filter_map(|i| i.expires_at).min();
        debug!(service, instances = instances.len(), "Discovery lookup");
        let target = self.pick(service, &instances, session)?;
        self.cache.insert(
            service.to_string(),
            CacheEntry {
                target: target.clone(),
                expires_at,
            },
        );
        Ok(target)
    }

    fn pick(
        &self,
        service: &str,
        instances: &[Instance],
        session: Option<&Session>,
    ) -> Result<ProxyTarget, GatewayError> {
        let chosen = self
            .business
            .select(service, instances, session)
            .ok_or_else(|| GatewayError::ProxyResolution {
                service: service.to_string(),
                reason: "no instance selected".into(),
            })?;
        Ok(ProxyTarget {
            service: service.to_string(),
            addr: chosen.addr.clone(),
        })
    }

    /// Drops the cached resolution of `service`.
    pub fn invalidate(&self, service: &str) -> bool {
        let removed = self.cache.remove(service).is_some();
        if removed {
            debug!(service, "Proxy cache invalidated");
        }
        removed
    }

    pub fn is_cached(&self, service: &str) -> bool {
        self.cache.contains_key(service)
    }

    /// Invalidates cache entries on discovery change events until the
    /// registry's event stream closes.
    pub fn spawn_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let selector = self.clone();
        let mut events = self.discovery.watch();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        selector.invalidate(event.service());
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Discovery events lagged, clearing proxy cache");
                        selector.cache.clear();
                    }
                    Err(RecvError::Closed) => {
                        info!("Discovery event stream closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Unknown-call fallback that forwards calls to their backend service.
pub struct ProxyCall {
    selector: Arc<ProxySelector>,
    client: Arc<BackendClient>,
}

impl ProxyCall {
    pub fn new(selector: Arc<ProxySelector>, client: Arc<BackendClient>) -> Self {
        Self { selector, client }
    }
}

#[async_trait]
impl CallHandler for ProxyCall {
    async fn call(&self, ctx: CallCtx) -> Result<Value, Status> {
        let target = self
            .selector
            .resolve(&ctx.path, ctx.session.as_deref())
            .await
            .map_err(|e| {
                debug!(path = %ctx.path, error = %e, "Proxy resolution failed");
                e.to_status()
            })?;

        let mut frame = Frame::call(0, ctx.path.clone(), ctx.body).with_codec(ctx.codec);
        frame.meta = ctx.meta;
        if let Some(session) = &ctx.session {
            frame
                .meta
                .insert(META_SESSION_ID.into(), session.id().to_string());
            if let Some(info) = session.auth_info() {
                frame.meta.insert(META_AUTH_INFO.into(), info.to_string());
            }
        }

        let reply = self.client.call(&target.addr, frame).await.map_err(|e| {
            warn!(path = %ctx.path, backend = %target.addr, error = %e, "Forwarding failed");
            e.to_status()
        })?;
        reply.into_result()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use proto::{DiscoveryError, StatusCode};
    use tokio::sync::broadcast;

    use super::*;
    use crate::business::DefaultBusiness;
    use crate::discovery::{DiscoveryEvent, MemoryDiscovery};

    /// Discovery wrapper that counts lookups.
    struct Counting {
        inner: MemoryDiscovery,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Discovery for Counting {
        async fn register(
            &self,
            service: &str,
            addr: &str,
            ttl: Option<Duration>,
        ) -> Result<(), DiscoveryError> {
            self.inner.register(service, addr, ttl).await
        }

        async fn deregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
            self.inner.deregister(service, addr).await
        }

        async fn resolve(&self, service: &str) -> Result<Vec<Instance>, DiscoveryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(service).await
        }

        fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
            self.inner.watch()
        }
    }

    fn selector() -> (Arc<ProxySelector>, Arc<Counting>) {
        let discovery = Arc::new(Counting {
            inner: MemoryDiscovery::new(),
            lookups: AtomicUsize::new(0),
        });
        let selector = ProxySelector::new(discovery.clone(), Arc::new(DefaultBusiness::new()));
        (selector, discovery)
    }

    #[test]
    fn service_is_first_path_segment() {
        assert_eq!(ProxySelector::service_of("/orders/create"), Some("orders"));
        assert_eq!(ProxySelector::service_of("//users"), Some("users"));
        assert_eq!(ProxySelector::service_of("/"), None);
    }

    #[tokio::test]
    async fn cached_resolution_skips_discovery_until_invalidated() {
        let (selector, discovery) = selector();
        discovery
            .register("orders", "10.0.0.1:7001", None)
            .await
            .expect("register");

        let first = selector.resolve("/orders/create", None).await.expect("resolve");
        assert_eq!(first.addr, "10.0.0.1:7001");
        selector.resolve("/orders/list", None).await.expect("cached");
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 1);
        assert!(selector.is_cached("orders"));

        assert!(selector.invalidate("orders"));
        selector.resolve("/orders/create", None).await.expect("resolve again");
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_target_is_stable_across_instances_until_invalidated() {
        let (selector, discovery) = selector();
        for addr in ["10.0.0.1:7001", "10.0.0.2:7001"] {
            discovery
                .register("orders", addr, None)
                .await
                .expect("register");
        }

        let a = selector.resolve("/orders/create", None).await.expect("first");
        for _ in 0..4 {
            let b = selector.resolve("/orders/create", None).await.expect("cached");
            assert_eq!(a, b);
        }
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 1);

        // Round-robin only advances when the resolution is refreshed.
        assert!(selector.invalidate("orders"));
        let c = selector.resolve("/orders/create", None).await.expect("refreshed");
        assert_ne!(a, c);
        assert_eq!(c, selector.resolve("/orders/list", None).await.expect("cached"));
    }

    #[tokio::test]
    async fn expired_lease_forces_a_fresh_lookup() {
        let (selector, discovery) = selector();
        discovery
            .register("orders", "10.0.0.1:7001", Some(Duration::from_millis(30)))
            .await
            .expect("register");
        selector.resolve("/orders/create", None).await.expect("resolve");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = selector
            .resolve("/orders/create", None)
            .await
            .expect_err("lease expired");
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 2);
        assert_eq!(err.to_status().code, StatusCode::NotFound);
        assert!(!selector.is_cached("orders"));
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let (selector, _) = selector();
        let err = selector
            .resolve("/orders/create", None)
            .await
            .expect_err("nothing registered");
        assert!(matches!(err, GatewayError::ProxyResolution { ref service, .. } if service == "orders"));
        assert_eq!(err.to_status().code, StatusCode::NotFound);
    }

    #[tokio::test]
    async fn watch_invalidates_on_registry_change() {
        let (selector, discovery) = selector();
        discovery
            .register("orders", "10.0.0.1:7001", None)
            .await
            .expect("register");
        let _watch = selector.spawn_watch();
        selector.resolve("/orders/create", None).await.expect("resolve");
        assert!(selector.is_cached("orders"));

        discovery
            .register("orders", "10.0.0.2:7001", None)
            .await
            .expect("second instance");
        tokio::time::timeout(Duration::from_secs(1), async {
            while selector.is_cached("orders") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cache invalidated");
    }
}
