use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::BalancerKind;
use crate::error::Result;

use super::{no_healthy_instance, LoadBalancer, ServiceInstance};

/// Weighted round-robin: the cursor is taken modulo the total weight of the
/// live instances and mapped onto them by walking cumulative weights. A total
/// weight of zero falls back to plain round-robin.
pub struct WeightedRoundRobinBalancer {
    service_name: String,
    instances: RwLock<Vec<Arc<ServiceInstance>>>,
    cursor: Mutex<u64>,
}

impl WeightedRoundRobinBalancer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instances: RwLock::new(Vec::new()),
            cursor: Mutex::new(0),
        }
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn kind(&self) -> BalancerKind {
        BalancerKind::WeightedRoundRobin
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

        let total_weight: u64 = alive.iter().map(|i| u64::from(i.weight)).sum();
        let mut cursor = self.cursor.lock();
        let position = *cursor;
        *cursor += 1;
        drop(cursor);

        if total_weight == 0 {
            return Ok(Arc::clone(alive[(position % alive.len() as u64) as usize]));
        }

        let target = position % total_weight;
        let mut cumulative = 0u64;
        for instance in &alive {
            cumulative += u64::from(instance.weight);
            if target < cumulative {
                return Ok(Arc::clone(instance));
            }
        }

        // Unreachable while target < total_weight; keep the last as a guard.
        Ok(Arc::clone(alive[alive.len() - 1]))
    }

    fn get_all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances.read().clone()
    }
}
