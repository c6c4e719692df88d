use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use axum::{
    http::{request::Parts, StatusCode},
    response::IntoResponse,
};
use tracing::warn;

use crate::breaker::CircuitBreakerService;
use crate::config::PluginSpec;
use crate::error::{GatewayError, Result};

use super::{Plugin, PluginAction};

/// Chain plugin that consults the circuit breaker for a service before the
/// proxy is invoked. Spec key: `service`.
pub struct CircuitBreakerPlugin {
    breakers: Arc<CircuitBreakerService>,
}

impl CircuitBreakerPlugin {
    pub fn new(breakers: Arc<CircuitBreakerService>) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl Plugin for CircuitBreakerPlugin {
    fn name(&self) -> &'static str {
        "circuitbreaker"
    }

    fn validate_spec(&self, spec: &PluginSpec) -> anyhow::Result<()> {
        if spec.get_str("service").is_none() {
            bail!("missing required key 'service'");
        }
        Ok(())
    }

    async fn execute(
        &self,
        _parts: &Parts,
        _peer: SocketAddr,
        spec: &PluginSpec,
    ) -> Result<PluginAction> {
        let service = spec.get_str("service").ok_or_else(|| {
            GatewayError::PluginConfig("circuitbreaker: missing 'service'".to_string())
        })?;

        if self.breakers.check_circuit(service) {
            Ok(PluginAction::Continue)
        } else {
            warn!(service, "request rejected by circuit breaker");
            Ok(PluginAction::Halt(
                (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response(),
            ))
        }
    }
}
