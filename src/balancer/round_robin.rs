use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::BalancerKind;
use crate::error::Result;

use super::{no_healthy_instance, LoadBalancer, ServiceInstance};

/// Plain round-robin: a monotonically increasing cursor taken modulo the
/// number of live instances.
pub struct RoundRobinBalancer {
    service_name: String,
    instances: RwLock<Vec<Arc<ServiceInstance>>>,
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instances: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn kind(&self) -> BalancerKind {
        BalancerKind::RoundRobin
    }

    fn register_instance(&self, instance: Arc<ServiceInstance>) {
        self.instances.write().push(instance);
    }

    fn get_next(&self) -> Result<Arc<ServiceInstance>> {
        let instances = self.instances.read();
        let alive: Vec<&Arc<ServiceInstance>> =
            instances.iter().filter(|i| i.is_alive()).collect();
        if alive.is_empty() {
            return Err(no_healthy_instance(&self.service_name, instances.len()));
        }

        let index = self.cursor.fetch_add(1, Ordering::SeqCst) % alive.len();
        Ok(Arc::clone(alive[index]))
    }

    fn get_all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer_with(urls: &[&str]) -> RoundRobinBalancer {
        let balancer = RoundRobinBalancer::new("svc");
        for url in urls {
            balancer.register_instance(ServiceInstance::new(*url, 1));
        }
        balancer
    }

    #[test]
    fn visits_each_instance_once_per_cycle() {
        let balancer = balancer_with(&["http://u1", "http://u2", "http://u3"]);

        let mut selections = Vec::new();
        for _ in 0..6 {
            selections.push(balancer.get_next().unwrap().url.clone());
        }
        assert_eq!(
            selections,
            ["http://u1", "http://u2", "http://u3", "http://u1", "http://u2", "http://u3"]
        );
    }

    #[test]
    fn skips_dead_instances() {
        let balancer = balancer_with(&["http://u1", "http://u2"]);
        balancer.get_all_instances()[0].set_alive(false);

        for _ in 0..3 {
            assert_eq!(balancer.get_next().unwrap().url, "http://u2");
        }
    }

    #[test]
    fn errors_when_nothing_is_alive() {
        let balancer = balancer_with(&["http://u1"]);
        balancer.get_all_instances()[0].set_alive(false);
        assert!(balancer.get_next().is_err());
    }

    #[test]
    fn get_all_returns_unfiltered_list() {
        let balancer = balancer_with(&["http://u1", "http://u2"]);
        balancer.get_all_instances()[0].set_alive(false);
        assert_eq!(balancer.get_all_instances().len(), 2);
    }
}
