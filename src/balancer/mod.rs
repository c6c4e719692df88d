mod least_connections;
mod round_robin;
mod weighted_round_robin;

pub use least_connections::LeastConnectionsBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted_round_robin::WeightedRoundRobinBalancer;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::config::BalancerKind;
use crate::error::{GatewayError, Result};

/// A single upstream endpoint belonging to a service. Created at startup and
/// shared between the balancer and the proxy.
#[derive(Debug)]
pub struct ServiceInstance {
    pub url: String,
    pub weight: u32,
    alive: AtomicBool,
    active_connections: AtomicU32,
}

impl ServiceInstance {
    pub fn new(url: impl Into<String>, weight: u32) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            weight,
            alive: AtomicBool::new(true),
            active_connections: AtomicU32::new(0),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_connection(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the connection counter, clamped at zero.
    pub(crate) fn release_connection(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }
}

pub trait LoadBalancer: Send + Sync {
    fn kind(&self) -> BalancerKind;

    fn register_instance(&self, instance: Arc<ServiceInstance>);

    /// Next instance according to the policy, restricted to live instances.
    fn get_next(&self) -> Result<Arc<ServiceInstance>>;

    /// The full registered list, unfiltered by liveness. Health-based
    /// skipping belongs to the proxy selection loop.
    fn get_all_instances(&self) -> Vec<Arc<ServiceInstance>>;

    /// Called once per request when it completes. Only least_connections
    /// tracks anything here.
    fn release(&self, _url: &str) {}
}

/// Keyed registry of per-service balancers, created lazily.
pub struct BalancerRegistry {
    balancers: DashMap<String, Arc<dyn LoadBalancer>>,
}

impl BalancerRegistry {
    pub fn new() -> Self {
        Self {
            balancers: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, service: &str, kind: BalancerKind) -> Arc<dyn LoadBalancer> {
        self.balancers
            .entry(service.to_string())
            .or_insert_with(|| {
                info!("created {} load balancer for service '{}'", kind, service);
                new_balancer(service, kind)
            })
            .clone()
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn LoadBalancer>> {
        self.balancers.get(service).map(|entry| entry.value().clone())
    }
}

impl Default for BalancerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn new_balancer(service: &str, kind: BalancerKind) -> Arc<dyn LoadBalancer> {
    match kind {
        BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new(service)),
        BalancerKind::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new(service)),
        BalancerKind::LeastConnections => Arc::new(LeastConnectionsBalancer::new(service)),
    }
}

pub(crate) fn no_healthy_instance(service: &str, registered: usize) -> GatewayError {
    if registered == 0 {
        GatewayError::NoInstances(service.to_string())
    } else {
        GatewayError::NoHealthyInstance(service.to_string())
    }
}
