mod auth;
mod circuit_breaker;
mod manager;
mod ratelimit;

pub use auth::AuthPlugin;
pub use circuit_breaker::CircuitBreakerPlugin;
pub use manager::PluginManager;
pub use ratelimit::RateLimitPlugin;

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{http::request::Parts, response::Response};

use crate::config::PluginSpec;
use crate::error::Result;

/// What a plugin decided about the current request.
pub enum PluginAction {
    /// Pass to the next plugin (and ultimately the proxy).
    Continue,
    /// The plugin produced the response; the chain stops and the proxy is
    /// never invoked.
    Halt(Response),
}

/// A middleware policy executed before proxying. Plugins are stateless
/// across requests; per-request state lives in the call.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Startup-time check of a route's spec for this plugin. A failure here
    /// refuses startup instead of surfacing as a 500 at request time.
    fn validate_spec(&self, _spec: &PluginSpec) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        parts: &Parts,
        peer: SocketAddr,
        spec: &PluginSpec,
    ) -> Result<PluginAction>;
}
