use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use axum::{
    http::{request::Parts, StatusCode},
    response::IntoResponse,
};
use tracing::{debug, error};

use crate::config::{PluginSpec, RouteConfig};

use super::{Plugin, PluginAction};

/// Plugin registry and chain executor. Built once at startup, immutable at
/// request time.
pub struct PluginManager {
    plugins: HashMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Register a plugin. Duplicate names refuse startup.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> anyhow::Result<()> {
        let name = plugin.name();
        if self.plugins.contains_key(name) {
            bail!("plugin '{}' is already registered", name);
        }
        debug!(plugin = name, "registered plugin");
        self.plugins.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// Startup-time validation of a route's plugin specs against the
    /// registry: every spec must name a registered plugin and satisfy that
    /// plugin's own checks.
    pub fn validate_route(&self, route: &RouteConfig) -> anyhow::Result<()> {
        for spec in &route.plugins {
            let name = match spec.name() {
                Some(name) => name,
                None => bail!("route '{}' has a plugin spec without a name", route.path_prefix),
            };
            let plugin = match self.get(name) {
                Some(plugin) => plugin,
                None => bail!("route '{}' references unregistered plugin '{}'", route.path_prefix, name),
            };
            if let Err(error) = plugin.validate_spec(spec) {
                bail!("route '{}', plugin '{}': {}", route.path_prefix, name, error);
            }
        }
        Ok(())
    }

    /// Run the chain in declared order. Policy denials come back as
    /// `Halt(response)`; plugin errors are logged and turned into a 500 that
    /// also halts the chain.
    pub async fn execute_chain(
        &self,
        parts: &Parts,
        peer: SocketAddr,
        specs: &[PluginSpec],
    ) -> PluginAction {
        for spec in specs {
            let name = match spec.name() {
                Some(name) => name,
                None => {
                    error!(?spec, "plugin spec is missing a 'name' key");
                    return PluginAction::Halt(
                        (StatusCode::INTERNAL_SERVER_ERROR, "plugin configuration error")
                            .into_response(),
                    );
                }
            };

            let plugin = match self.get(name) {
                Some(plugin) => plugin,
                None => {
                    error!(plugin = name, "no such plugin registered");
                    return PluginAction::Halt(
                        (StatusCode::INTERNAL_SERVER_ERROR, "plugin configuration error")
                            .into_response(),
                    );
                }
            };

            match plugin.execute(parts, peer, spec).await {
                Ok(PluginAction::Continue) => continue,
                Ok(PluginAction::Halt(response)) => {
                    debug!(plugin = name, "plugin halted the chain");
                    return PluginAction::Halt(response);
                }
                Err(error) => {
                    error!(plugin = name, %error, "plugin execution failed");
                    return PluginAction::Halt(error.into_response());
                }
            }
        }

        PluginAction::Continue
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_yaml::Value;

    struct StaticPlugin {
        name: &'static str,
        action: fn() -> crate::error::Result<PluginAction>,
    }

    #[async_trait]
    impl Plugin for StaticPlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(
            &self,
            _req: &Request<Body>,
            _peer: SocketAddr,
            _spec: &PluginSpec,
        ) -> crate::error::Result<PluginAction> {
            (self.action)()
        }
    }

    fn spec(name: &str) -> PluginSpec {
        let mut map = HashMap::new();
        map.insert("name".to_string(), Value::String(name.to_string()));
        PluginSpec(map)
    }

    fn request() -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri("/x")
            .body(Body::empty())
            .unwrap()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn manager_with(plugins: Vec<StaticPlugin>) -> PluginManager {
        let mut manager = PluginManager::new();
        for plugin in plugins {
            manager.register(Arc::new(plugin)).unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn chain_continues_through_passing_plugins() {
        let manager = manager_with(vec![
            StaticPlugin { name: "a", action: || Ok(PluginAction::Continue) },
            StaticPlugin { name: "b", action: || Ok(PluginAction::Continue) },
        ]);

        let action = manager
            .execute_chain(&request(), peer(), &[spec("a"), spec("b")])
            .await;
        assert!(matches!(action, PluginAction::Continue));
    }

    #[tokio::test]
    async fn halting_plugin_short_circuits() {
        let manager = manager_with(vec![
            StaticPlugin {
                name: "deny",
                action: || Ok(PluginAction::Halt(
                    (StatusCode::TOO_MANY_REQUESTS, "nope").into_response(),
                )),
            },
            StaticPlugin {
                name: "later",
                action: || panic!("must not run after a halt"),
            },
        ]);

        let action = manager
            .execute_chain(&request(), peer(), &[spec("deny"), spec("later")])
            .await;
        match action {
            PluginAction::Halt(response) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS)
            }
            PluginAction::Continue => panic!("expected a halt"),
        }
    }

    #[tokio::test]
    async fn plugin_error_becomes_500() {
        let manager = manager_with(vec![StaticPlugin {
            name: "broken",
            action: || Err(GatewayError::Internal("boom".to_string())),
        }]);

        let action = manager.execute_chain(&request(), peer(), &[spec("broken")]).await;
        match action {
            PluginAction::Halt(response) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR)
            }
            PluginAction::Continue => panic!("expected a halt"),
        }
    }

    #[tokio::test]
    async fn missing_name_and_unknown_plugin_are_500s() {
        let manager = manager_with(vec![]);

        let nameless = PluginSpec(HashMap::new());
        match manager.execute_chain(&request(), peer(), &[nameless]).await {
            PluginAction::Halt(response) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR)
            }
            PluginAction::Continue => panic!("expected a halt"),
        }

        match manager.execute_chain(&request(), peer(), &[spec("ghost")]).await {
            PluginAction::Halt(response) => {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR)
            }
            PluginAction::Continue => panic!("expected a halt"),
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut manager = PluginManager::new();
        manager
            .register(Arc::new(StaticPlugin { name: "dup", action: || Ok(PluginAction::Continue) }))
            .unwrap();
        let err = manager
            .register(Arc::new(StaticPlugin { name: "dup", action: || Ok(PluginAction::Continue) }))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }
}
