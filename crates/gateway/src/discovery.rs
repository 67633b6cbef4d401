//! Service discovery client interface and an in-process registry.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use proto::DiscoveryError;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::DiscoveryConfig;

/// One registered backend instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub service: String,
    pub addr: String,
    /// Lease deadline; `None` for permanent registrations.
    pub expires_at: Option<Instant>,
}

impl Instance {
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Registry change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Registered { service: String, addr: String },
    Deregistered { service: String, addr: String },
}

impl DiscoveryEvent {
    pub fn service(&self) -> &str {
        match self {
            Self::Registered { service, .. } | Self::Deregistered { service, .. } => service,
        }
    }
}

/// Register/resolve/watch interface of a discovery registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Registers or renews `addr` under `service`; `ttl = None` never expires.
    async fn register(
        &self,
        service: &str,
        addr: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DiscoveryError>;

    async fn deregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError>;

    /// Live instances of `service`; an empty result is an error.
    async fn resolve(&self, service: &str) -> Result<Vec<Instance>, DiscoveryError>;

    /// Subscribes to change notifications.
    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent>;
}

/// In-process registry with lease expiry.
pub struct MemoryDiscovery {
    services: DashMap<String, Vec<Instance>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl Default for MemoryDiscovery {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            services: DashMap::new(),
            events,
        }
    }
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the permanent instances from config.
    pub fn from_config(cfg: &DiscoveryConfig) -> Self {
        let registry = Self::new();
        for svc in &cfg.services {
            registry.insert(&svc.name, &svc.addr, None);
        }
        info!(services = cfg.services.len(), "Static discovery entries loaded");
        registry
    }

    fn insert(&self, service: &str, addr: &str, ttl: Option<Duration>) {
        let instance = Instance {
            service: service.to_string(),
            addr: addr.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let mut entry = self.services.entry(service.to_string()).or_default();
        entry.retain(|i| i.addr != addr);
        entry.push(instance);
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn register(
        &self,
        service: &str,
        addr: &str,
        ttl: Option<Duration>,
    ) -> Result<(), DiscoveryError> {
        self.insert(service, addr, ttl);
        debug!(service, addr, ?ttl, "Instance registered");
        let _ = self.events.send(DiscoveryEvent::Registered {
            service: service.to_string(),
            addr: addr.to_string(),
        });
        Ok(())
    }

    async fn deregister(&self, service: &str, addr: &str) -> Result<(), DiscoveryError> {
        let removed = self
            .services
            .get_mut(service)
            .map(|mut list| {
                let before = list.len();
                list.retain(|i| i.addr != addr);
                before != list.len()
            })
            .unwrap_or(false);
        if !removed {
            return Err(DiscoveryError::NotRegistered(format!("{service} at {addr}")));
        }
        debug!(service, addr, "Instance deregistered");
        let _ = self.events.send(DiscoveryEvent::Deregistered {
            service: service.to_string(),
            addr: addr.to_string(),
        });
        Ok(())
    }

    async fn resolve(&self, service: &str) -> Result<Vec<Instance>, DiscoveryError> {
        let now = Instant::now();
        let live: Vec<Instance> = self
            .services
            .get(service)
            .map(|list| list.iter().filter(|i| i.is_live(now)).cloned().collect())
            .unwrap_or_default();
        if live.is_empty() {
            return Err(DiscoveryError::NotRegistered(service.to_string()));
        }
        Ok(live)
    }

    fn watch(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}
