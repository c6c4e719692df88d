use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Everything the checker tracks for one service.
struct ServiceHealth {
    instances: Vec<String>,
    health_path: String,
    /// Instance URL -> is healthy. Written by the probe loop only.
    status: RwLock<HashMap<String, bool>>,
}

/// Monitors upstream instance liveness with periodic HTTP probes. Instances
/// start healthy; a probe marks an instance healthy iff the transport
/// succeeded and the status was 200 OK.
pub struct HealthChecker {
    client: Client,
    services: DashMap<String, Arc<ServiceHealth>>,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration, interval: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to create health check HTTP client")?;

        Ok(Self {
            client,
            services: DashMap::new(),
            interval,
        })
    }

    /// Register a service's instances for probing. All instances start out
    /// healthy.
    pub fn register_service(&self, name: &str, instances: Vec<String>, health_path: &str) {
        let status = instances.iter().map(|url| (url.clone(), true)).collect();
        let entry = ServiceHealth {
            instances,
            health_path: health_path.to_string(),
            status: RwLock::new(status),
        };
        info!(service = name, instance_count = entry.instances.len(),
            health_path, "registered service for health checking");
        self.services.insert(name.to_string(), Arc::new(entry));
    }

    /// Current liveness of one instance. Unregistered (service, url) pairs
    /// are reported unhealthy.
    pub fn is_instance_healthy(&self, service: &str, url: &str) -> bool {
        match self.services.get(service) {
            Some(entry) => *entry.status.read().get(url).unwrap_or(&false),
            None => false,
        }
    }

    /// Snapshot of every service's instance statuses, for `/healthz`.
    pub fn all_statuses(&self) -> HashMap<String, HashMap<String, bool>> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().status.read().clone()))
            .collect()
    }

    /// Probe loop. Fires every interval until shutdown; in-flight probes are
    /// left to finish on their own.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("health checker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    info!("health checker stopped");
                    return;
                }
            }
        }
    }

    /// One probe sweep over every registered service, fanned out per
    /// service. Factored out of `run` so tests can drive ticks directly.
    pub async fn run_once(&self) {
        let mut probes = Vec::new();
        for entry in self.services.iter() {
            let client = self.client.clone();
            let service = entry.key().clone();
            let health = Arc::clone(entry.value());
            probes.push(tokio::spawn(async move {
                check_service(&client, &service, &health).await;
            }));
        }
        for probe in probes {
            let _ = probe.await;
        }
    }
}

async fn check_service(client: &Client, service: &str, health: &ServiceHealth) {
    for url in &health.instances {
        let check_url = format!("{}{}", url.trim_end_matches('/'), health.health_path);
        let healthy = probe(client, &check_url).await;
        update_status(service, health, url, healthy);
    }
}

async fn probe(client: &Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => {
            let healthy = response.status() == reqwest::StatusCode::OK;
            // Drain the body so the connection can be reused.
            let _ = response.bytes().await;
            healthy
        }
        Err(error) => {
            debug!(url, %error, "health probe failed");
            false
        }
    }
}

fn update_status(service: &str, health: &ServiceHealth, url: &str, healthy: bool) {
    let mut status = health.status.write();
    let previous = status.insert(url.to_string(), healthy);
    if previous != Some(healthy) {
        if healthy {
            info!(service, instance = url, "instance became healthy");
        } else {
            warn!(service, instance = url, "instance became unhealthy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker() -> Arc<HealthChecker> {
        Arc::new(HealthChecker::new(Duration::from_millis(500), Duration::from_secs(10)).unwrap())
    }

    #[tokio::test]
    async fn unregistered_pairs_are_unhealthy() {
        let checker = checker();
        assert!(!checker.is_instance_healthy("nope", "http://u1"));

        checker.register_service("svc", vec!["http://u1".to_string()], "/health");
        assert!(!checker.is_instance_healthy("svc", "http://other"));
    }

    #[tokio::test]
    async fn instances_start_healthy() {
        let checker = checker();
        checker.register_service("svc", vec!["http://u1".to_string()], "/health");
        assert!(checker.is_instance_healthy("svc", "http://u1"));
    }

    #[tokio::test]
    async fn probe_failure_marks_unhealthy_and_recovery_marks_healthy() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&upstream)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&upstream)
            .await;

        let checker = checker();
        checker.register_service("svc", vec![upstream.uri()], "/health");

        checker.run_once().await;
        assert!(!checker.is_instance_healthy("svc", &upstream.uri()));

        checker.run_once().await;
        assert!(checker.is_instance_healthy("svc", &upstream.uri()));
    }

    #[tokio::test]
    async fn unreachable_instance_is_unhealthy() {
        let checker = checker();
        // Nothing listens on this port.
        checker.register_service("svc", vec!["http://127.0.0.1:1".to_string()], "/health");

        checker.run_once().await;
        assert!(!checker.is_instance_healthy("svc", "http://127.0.0.1:1"));
    }

    #[tokio::test]
    async fn statuses_snapshot_covers_all_services() {
        let checker = checker();
        checker.register_service("a", vec!["http://u1".to_string()], "/health");
        checker.register_service("b", vec!["http://u2".to_string(), "http://u3".to_string()], "/health");

        let statuses = checker.all_statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["b"].len(), 2);
        assert!(statuses["a"]["http://u1"]);
    }
}
