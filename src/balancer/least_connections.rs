use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BalancerKind;
use crate::error::Result;

use super::{no_healthy_instance, LoadBalancer, ServiceInstance};

/// Least-connections: selects the live instance with the fewest active
/// connections (ties go to the lowest index) and increments its counter.
/// The proxy releases the count when the request completes.
pub struct LeastConnectionsBalancer {
    service_name: String,
    instances: Mutex<Vec<Arc<ServiceInstance>>>,
}

impl LeastConnectionsBalancer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instances: Mutex::new(Vec::new()),
        }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn kind(&self) -> BalancerKind {
        BalancerKind::LeastConnections
    }

    fn register_instance(&self, instance: Arc<ServiceInstance>) {
        self.instances.lock().push(instance);
    }

    fn get_next(&self) -> Result<Arc<ServiceInstance>> {
        // Selection and increment happen under the same lock so concurrent
        // requests observe each other's counts.
        let instances = self.instances.lock();

        let mut selected: Option<&Arc<ServiceInstance>> = None;
        let mut min_connections = u32::MAX;
        for instance in instances.iter() {
            if !instance.is_alive() {
                continue;
            }
            let connections = instance.active_connections();
            if connections < min_connections {
                min_connections = connections;
                selected = Some(instance);
            }
        }

        match selected {
            Some(instance) => {
                instance.acquire_connection();
                Ok(Arc::clone(instance))
            }
            None => Err(no_healthy_instance(&self.service_name, instances.len())),
        }
    }

    fn get_all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances.lock().clone()
    }

    fn release(&self, url: &str) {
        let instances = self.instances.lock();
        if let Some(instance) = instances.iter().find(|i| i.url == url) {
            instance.release_connection();
        }
    }
}
