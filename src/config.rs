use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level configuration, one struct per YAML section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    pub jwt: Option<JwtConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address in the ":8080" / "0.0.0.0:8080" form.
    pub port: String,
    #[serde(default = "default_shutdown_grace", with = "duration_serde")]
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Resolve the configured port string to a bindable socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let candidate = if self.port.starts_with(':') {
            format!("0.0.0.0{}", self.port)
        } else if self.port.contains(':') {
            self.port.clone()
        } else {
            format!("0.0.0.0:{}", self.port)
        };
        candidate
            .parse()
            .with_context(|| format!("invalid server.port: {:?}", self.port))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval", with = "duration_serde")]
    pub interval: Duration,
    #[serde(default = "default_health_timeout", with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub instances: Vec<InstanceConfig>,
    #[serde(default = "default_health_path")]
    pub health_check_path: String,
    #[serde(default)]
    pub load_balancer: BalancerKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl BalancerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalancerKind::RoundRobin => "round_robin",
            BalancerKind::WeightedRoundRobin => "weighted_round_robin",
            BalancerKind::LeastConnections => "least_connections",
        }
    }
}

impl fmt::Display for BalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub service_name: String,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub requires_auth: bool,
}

/// A plugin invocation as configured on a route: a reserved `name` key plus
/// arbitrary plugin-specific keys. Unknown keys are ignored by plugins.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PluginSpec(pub HashMap<String, serde_yaml::Value>);

impl PluginSpec {
    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    /// Non-empty string value for `key`, if present.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|value| value.as_str())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RateLimitingConfig {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitRule {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "tokenBucket")]
    pub token_bucket: Option<TokenBucketParams>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenBucketParams {
    pub capacity: u64,
    #[serde(rename = "refillRate")]
    pub refill_rate: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_reset_timeout", with = "duration_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JwtConfig {
    pub secret_key: String,
    #[serde(default = "default_jwt_duration")]
    pub duration_minutes: u64,
}

const KNOWN_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

impl Config {
    /// Load configuration from a YAML file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path))?;

        Self::from_yaml(&content).with_context(|| format!("failed to load config file: {}", path))
    }

    /// Parse, normalize and validate a YAML configuration document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).context("failed to parse configuration")?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for route in &mut self.routes {
            if !route.path_prefix.is_empty() && !route.path_prefix.starts_with('/') {
                route.path_prefix.insert(0, '/');
            }
            if let Some(methods) = &mut route.methods {
                for method in methods.iter_mut() {
                    *method = method.to_ascii_uppercase();
                }
            }
        }
    }

    /// Validate configuration. Any failure here refuses startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.port.is_empty() {
            bail!("server.port cannot be empty");
        }
        self.server.bind_addr()?;

        if self.health_check.interval.is_zero() {
            bail!("health_check.interval must be positive");
        }
        if self.health_check.timeout.is_zero() {
            bail!("health_check.timeout must be positive");
        }

        for (name, service) in &self.services {
            if service.instances.is_empty() {
                bail!("service '{}' must have at least one instance", name);
            }
            for instance in &service.instances {
                let url = reqwest::Url::parse(&instance.url).with_context(|| {
                    format!("invalid instance URL {:?} in service '{}'", instance.url, name)
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    bail!(
                        "instance URL {:?} in service '{}' must be http or https",
                        instance.url,
                        name
                    );
                }
                if url.host_str().is_none() {
                    bail!(
                        "instance URL {:?} in service '{}' has no host",
                        instance.url,
                        name
                    );
                }
            }
        }

        for route in &self.routes {
            if route.path_prefix.is_empty() {
                bail!("route path_prefix cannot be empty");
            }
            if !self.services.contains_key(&route.service_name) {
                bail!(
                    "route '{}' references unknown service '{}'",
                    route.path_prefix,
                    route.service_name
                );
            }
            if let Some(methods) = &route.methods {
                for method in methods {
                    if !KNOWN_METHODS.contains(&method.as_str()) {
                        bail!(
                            "route '{}' lists unknown HTTP method '{}'",
                            route.path_prefix,
                            method
                        );
                    }
                }
            }
            for spec in &route.plugins {
                if spec.name().is_none() {
                    bail!(
                        "route '{}' has a plugin spec without a 'name' key",
                        route.path_prefix
                    );
                }
            }
        }

        let mut rule_names = HashSet::new();
        for rule in &self.rate_limiting.rules {
            if rule.name.is_empty() {
                bail!("rate limit rule names cannot be empty");
            }
            if !rule_names.insert(rule.name.as_str()) {
                bail!("duplicate rate limit rule '{}'", rule.name);
            }
            match rule.kind.as_str() {
                "memory_token_bucket" => {
                    let params = rule.token_bucket.as_ref().ok_or_else(|| {
                        anyhow::anyhow!("rate limit rule '{}' is missing tokenBucket", rule.name)
                    })?;
                    if params.capacity == 0 {
                        bail!("rate limit rule '{}' capacity must be positive", rule.name);
                    }
                    if params.refill_rate == 0 {
                        bail!("rate limit rule '{}' refillRate must be positive", rule.name);
                    }
                }
                "" | "noop" => {}
                other => bail!("rate limit rule '{}' has unknown type '{}'", rule.name, other),
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be positive");
        }
        if self.circuit_breaker.success_threshold == 0 {
            bail!("circuit_breaker.success_threshold must be positive");
        }
        if self.circuit_breaker.reset_timeout.is_zero() {
            bail!("circuit_breaker.reset_timeout must be positive");
        }

        Ok(())
    }
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_jwt_duration() -> u64 {
    60
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let parse = |num: &str| {
            num.parse::<u64>()
                .map_err(|e| format!("invalid duration {:?}: {}", s, e))
        };
        if let Some(num) = s.strip_suffix("ms") {
            Ok(Duration::from_millis(parse(num)?))
        } else if let Some(num) = s.strip_suffix('s') {
            Ok(Duration::from_secs(parse(num)?))
        } else if let Some(num) = s.strip_suffix('m') {
            Ok(Duration::from_secs(parse(num)? * 60))
        } else if let Some(num) = s.strip_suffix('h') {
            Ok(Duration::from_secs(parse(num)? * 3600))
        } else {
            Ok(Duration::from_secs(parse(s)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: ":8080"
health_check:
  interval: 10s
  timeout: 500ms
services:
  user-service:
    instances:
      - url: http://127.0.0.1:9101
        weight: 3
      - url: http://127.0.0.1:9102
    health_check_path: /health
    load_balancer: weighted_round_robin
routes:
  - path_prefix: api/users
    service_name: user-service
    methods: [get, POST]
    plugins:
      - name: ratelimit
        rule: api-default
        strategy: ip
rate_limiting:
  rules:
    - name: api-default
      type: memory_token_bucket
      tokenBucket:
        capacity: 100
        refillRate: 10
circuit_breaker:
  failure_threshold: 3
  success_threshold: 2
  reset_timeout: 1m
jwt:
  secret_key: test-secret
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.server.port, ":8080");
        assert_eq!(config.health_check.interval, Duration::from_secs(10));
        assert_eq!(config.health_check.timeout, Duration::from_millis(500));

        let service = &config.services["user-service"];
        assert_eq!(service.instances.len(), 2);
        assert_eq!(service.instances[0].weight, 3);
        assert_eq!(service.instances[1].weight, 1);
        assert_eq!(service.load_balancer, BalancerKind::WeightedRoundRobin);

        let rule = &config.rate_limiting.rules[0];
        assert_eq!(rule.token_bucket.as_ref().unwrap().capacity, 100);

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(60));
        assert_eq!(config.jwt.as_ref().unwrap().duration_minutes, 60);
    }

    #[test]
    fn normalizes_prefix_and_methods() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let route = &config.routes[0];
        assert_eq!(route.path_prefix, "/api/users");
        assert_eq!(route.methods.as_deref().unwrap(), ["GET", "POST"]);
    }

    #[test]
    fn bind_addr_accepts_port_only_form() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.server.bind_addr().unwrap().port(), 8080);
    }

    #[test]
    fn rejects_route_to_unknown_service() {
        let yaml = SAMPLE.replace("service_name: user-service", "service_name: nope");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown service"));
    }

    #[test]
    fn rejects_non_http_instance_url() {
        let yaml = SAMPLE.replace("http://127.0.0.1:9101", "ftp://127.0.0.1:9101");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_zero_capacity_bucket() {
        let yaml = SAMPLE.replace("capacity: 100", "capacity: 0");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("capacity"));
    }

    #[test]
    fn rejects_unknown_rule_type() {
        let yaml = SAMPLE.replace("type: memory_token_bucket", "type: redis_token_bucket");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_plugin_spec_without_name() {
        let yaml = SAMPLE.replace("- name: ratelimit", "- rule2: x");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn rejects_unknown_method() {
        let yaml = SAMPLE.replace("methods: [get, POST]", "methods: [FETCH]");
        assert!(Config::from_yaml(&yaml).is_err());
    }
}
