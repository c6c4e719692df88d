use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use axum::{
    http::{request::Parts, StatusCode},
    response::IntoResponse,
};
use tracing::{info, warn};

use crate::config::PluginSpec;
use crate::error::{GatewayError, Result};
use crate::limiter::RateLimitEngine;

use super::{Plugin, PluginAction};

const HEADER_X_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_X_REAL_IP: &str = "x-real-ip";

const STRATEGIES: &[&str] = &["ip", "path", "global"];

/// Chain plugin enforcing a named rate limit rule. Spec keys: `rule` (the
/// configured rule name) and `strategy` (`ip` | `path` | `global`).
pub struct RateLimitPlugin {
    engine: Arc<RateLimitEngine>,
}

impl RateLimitPlugin {
    pub fn new(engine: Arc<RateLimitEngine>) -> Self {
        Self { engine }
    }

    fn parse_spec<'a>(&self, spec: &'a PluginSpec) -> Result<(&'a str, &'a str)> {
        let rule = spec
            .get_str("rule")
            .ok_or_else(|| GatewayError::PluginConfig("ratelimit: missing 'rule'".to_string()))?;
        let strategy = spec.get_str("strategy").ok_or_else(|| {
            GatewayError::PluginConfig("ratelimit: missing 'strategy'".to_string())
        })?;
        Ok((rule, strategy))
    }

    /// Derive the rate-limit key from the request per the configured
    /// strategy. An empty result means "could not identify the caller".
    fn identifier(parts: &Parts, peer: SocketAddr, strategy: &str) -> String {
        match strategy {
            "ip" => {
                // X-Forwarded-For may hold "client, proxy1, proxy2"; the
                // first entry is the original client.
                if let Some(forwarded) = header_str(parts, HEADER_X_FORWARDED_FOR) {
                    if let Some(client) = forwarded.split(',').next() {
                        let client = client.trim();
                        if !client.is_empty() {
                            return client.to_string();
                        }
                    }
                }
                if let Some(real_ip) = header_str(parts, HEADER_X_REAL_IP) {
                    return real_ip.to_string();
                }
                peer.ip().to_string()
            }
            "path" => parts.uri.path().to_string(),
            "global" => "global".to_string(),
            _ => String::new(),
        }
    }
}

fn header_str<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn name(&self) -> &'static str {
        "ratelimit"
    }

    fn validate_spec(&self, spec: &PluginSpec) -> anyhow::Result<()> {
        let rule = match spec.get_str("rule") {
            Some(rule) => rule,
            None => bail!("missing required key 'rule'"),
        };
        if !self.engine.has_rule(rule) {
            bail!("references undefined rate limit rule '{}'", rule);
        }
        match spec.get_str("strategy") {
            Some(strategy) if STRATEGIES.contains(&strategy) => Ok(()),
            Some(strategy) => bail!("unknown strategy '{}'", strategy),
            None => bail!("missing required key 'strategy'"),
        }
    }

    async fn execute(
        &self,
        parts: &Parts,
        peer: SocketAddr,
        spec: &PluginSpec,
    ) -> Result<PluginAction> {
        let (rule, strategy) = self.parse_spec(spec)?;

        let identifier = Self::identifier(parts, peer, strategy);
        if identifier.is_empty() {
            // Fail open: an unidentifiable caller is let through.
            warn!(rule, strategy, "no identifier for request, skipping rate limit");
            return Ok(PluginAction::Continue);
        }

        if self.engine.check(rule, &identifier)? {
            Ok(PluginAction::Continue)
        } else {
            info!(rule, %identifier, "request rate limited");
            Ok(PluginAction::Halt(
                (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response(),
            ))
        }
    }
}
