mod token_bucket;

pub use token_bucket::MemoryTokenBucket;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result as AnyResult};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::RateLimitingConfig;
use crate::error::{GatewayError, Result};

/// How often idle buckets are swept, and how long a bucket may sit idle
/// before the sweeper drops it.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BUCKET_IDLE: Duration = Duration::from_secs(300);

pub trait RateLimiter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether one request for `identifier` is admitted right now.
    fn allow(&self, identifier: &str) -> bool;

    /// Drop per-identifier state idle for longer than `idle_for`.
    fn sweep(&self, _idle_for: Duration) {}
}

/// Limiter that admits everything, for rule type `noop`.
pub struct NoopLimiter {
    name: String,
}

impl NoopLimiter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl RateLimiter for NoopLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn allow(&self, _identifier: &str) -> bool {
        true
    }
}

/// Rule-name keyed registry of limiters, built once from configuration and
/// immutable afterwards.
pub struct RateLimitEngine {
    limiters: HashMap<String, Arc<dyn RateLimiter>>,
}

impl RateLimitEngine {
    pub fn from_config(config: &RateLimitingConfig) -> AnyResult<Self> {
        let mut limiters: HashMap<String, Arc<dyn RateLimiter>> = HashMap::new();

        for rule in &config.rules {
            let limiter: Arc<dyn RateLimiter> = match rule.kind.as_str() {
                "memory_token_bucket" => {
                    let params = match rule.token_bucket.as_ref() {
                        Some(params) => params,
                        None => bail!("rate limit rule '{}' is missing tokenBucket", rule.name),
                    };
                    Arc::new(MemoryTokenBucket::new(
                        rule.name.as_str(),
                        params.capacity,
                        params.refill_rate,
                    ))
                }
                "" | "noop" => Arc::new(NoopLimiter::new(rule.name.as_str())),
                other => bail!("unknown rate limiter type '{}' for rule '{}'", other, rule.name),
            };
            let kind = if rule.kind.is_empty() { "noop" } else { rule.kind.as_str() };
            info!(rule = %rule.name, kind, "initialized rate limit rule");
            limiters.insert(rule.name.clone(), limiter);
        }

        Ok(Self { limiters })
    }

    pub fn has_rule(&self, rule: &str) -> bool {
        self.limiters.contains_key(rule)
    }

    /// Check whether `identifier` is admitted under `rule`. Referencing an
    /// undefined rule is a configuration bug surfaced as a 500.
    pub fn check(&self, rule: &str, identifier: &str) -> Result<bool> {
        let limiter = self
            .limiters
            .get(rule)
            .ok_or_else(|| GatewayError::UnknownRateLimitRule(rule.to_string()))?;
        Ok(limiter.allow(identifier))
    }

    /// Periodically sweep idle buckets until shutdown is signalled.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for limiter in self.limiters.values() {
                        limiter.sweep(BUCKET_IDLE);
                    }
                    debug!("swept idle rate limiter state");
                }
                _ = shutdown.changed() => {
                    info!("rate limiter sweeper stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RateLimitRule, TokenBucketParams};

    fn engine_with(rules: Vec<RateLimitRule>) -> RateLimitEngine {
        RateLimitEngine::from_config(&RateLimitingConfig { rules }).unwrap()
    }

    fn bucket_rule(name: &str, capacity: u64, refill_rate: u64) -> RateLimitRule {
        RateLimitRule {
            name: name.to_string(),
            kind: "memory_token_bucket".to_string(),
            token_bucket: Some(TokenBucketParams { capacity, refill_rate }),
        }
    }

    #[test]
    fn unknown_rule_is_an_error() {
        let engine = engine_with(vec![bucket_rule("r1", 2, 1)]);
        assert!(engine.check("r1", "id").unwrap());
        assert!(matches!(
            engine.check("missing", "id"),
            Err(GatewayError::UnknownRateLimitRule(_))
        ));
    }

    #[test]
    fn noop_rule_always_allows() {
        let engine = engine_with(vec![RateLimitRule {
            name: "open".to_string(),
            kind: "noop".to_string(),
            token_bucket: None,
        }]);

        for _ in 0..1000 {
            assert!(engine.check("open", "id").unwrap());
        }
    }

    #[test]
    fn empty_kind_defaults_to_noop() {
        let engine = engine_with(vec![RateLimitRule {
            name: "open".to_string(),
            kind: String::new(),
            token_bucket: None,
        }]);
        assert!(engine.check("open", "id").unwrap());
    }

    #[test]
    fn unknown_kind_refuses_construction() {
        let result = RateLimitEngine::from_config(&RateLimitingConfig {
            rules: vec![RateLimitRule {
                name: "r".to_string(),
                kind: "redis".to_string(),
                token_bucket: None,
            }],
        });
        assert!(result.is_err());
    }
}
