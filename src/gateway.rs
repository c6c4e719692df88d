use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Result as AnyResult};
use axum::{
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::balancer::{BalancerRegistry, ServiceInstance};
use crate::breaker::CircuitBreakerService;
use crate::config::{Config, PluginSpec};
use crate::error::GatewayError;
use crate::health::HealthChecker;
use crate::limiter::RateLimitEngine;
use crate::plugin::{AuthPlugin, CircuitBreakerPlugin, PluginAction, PluginManager, RateLimitPlugin};
use crate::proxy::Proxy;
use crate::router::Router;
use crate::shutdown::Shutdown;

/// The assembled gateway: router, plugin chain, proxy and the shared state
/// machines behind them. Everything is built once from configuration.
pub struct Gateway {
    router: Router,
    plugins: PluginManager,
    proxy: Proxy,
    health: Arc<HealthChecker>,
    breakers: Arc<CircuitBreakerService>,
    limiter: Arc<RateLimitEngine>,
}

impl Gateway {
    pub fn new(config: Config) -> AnyResult<Arc<Self>> {
        let health = Arc::new(HealthChecker::new(
            config.health_check.timeout,
            config.health_check.interval,
        )?);

        let balancers = Arc::new(BalancerRegistry::new());
        for (name, service) in &config.services {
            let urls: Vec<String> = service.instances.iter().map(|i| i.url.clone()).collect();
            health.register_service(name, urls, &service.health_check_path);

            let balancer = balancers.get_or_create(name, service.load_balancer);
            for instance in &service.instances {
                balancer.register_instance(ServiceInstance::new(instance.url.as_str(), instance.weight));
            }
            info!(service = %name, instances = service.instances.len(),
                balancer = %service.load_balancer, "configured service");
        }

        let breakers = Arc::new(CircuitBreakerService::new(&config.circuit_breaker));
        let limiter = Arc::new(RateLimitEngine::from_config(&config.rate_limiting)?);

        let mut plugins = PluginManager::new();
        plugins.register(Arc::new(RateLimitPlugin::new(Arc::clone(&limiter))))?;
        plugins.register(Arc::new(CircuitBreakerPlugin::new(Arc::clone(&breakers))))?;
        if let Some(jwt) = &config.jwt {
            plugins.register(Arc::new(AuthPlugin::new(jwt)))?;
        }

        for route in &config.routes {
            plugins.validate_route(route)?;
            if route.requires_auth && config.jwt.is_none() {
                bail!(
                    "route '{}' requires auth but no jwt section is configured",
                    route.path_prefix
                );
            }
        }

        let proxy = Proxy::new(Arc::clone(&balancers), Arc::clone(&health), Arc::clone(&breakers))?;
        let router = Router::new(config.routes.clone());

        Ok(Arc::new(Self {
            router,
            plugins,
            proxy,
            health,
            breakers,
            limiter,
        }))
    }

    /// The axum application: administrative endpoints first, everything else
    /// falls through to the proxy pipeline. Administrative endpoints do not
    /// pass through the plugin chain.
    pub fn app(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route("/healthz", get(healthz))
            .route("/circuit-breaker/status", get(circuit_status))
            .route("/circuit-breaker/reset", post(circuit_reset))
            .fallback(proxy_request)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Spawn the background loops bound to the gateway's lifetime.
    pub fn start_background(self: &Arc<Self>, shutdown: &Shutdown) {
        tokio::spawn(Arc::clone(&self.health).run(shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self.limiter).run_sweeper(shutdown.subscribe()));
    }

    /// Router -> auth -> plugin chain -> proxy.
    async fn handle(&self, req: Request<Body>, peer: SocketAddr) -> Response {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let route = match self.router.find_route(&method, &path) {
            Some(route) => route,
            None => return (StatusCode::NOT_FOUND, "Not Found").into_response(),
        };

        if route.requires_auth {
            let auth = match self.plugins.get("auth") {
                Some(auth) => auth,
                None => {
                    // Construction refuses this configuration; keep a guard.
                    error!(route = %route.path_prefix, "auth required but no auth plugin registered");
                    return GatewayError::Internal("auth misconfigured".to_string()).into_response();
                }
            };
            match auth.execute(&req, peer, &PluginSpec::default()).await {
                Ok(PluginAction::Continue) => {}
                Ok(PluginAction::Halt(response)) => return response,
                Err(error) => return error.into_response(),
            }
        }

        match self.plugins.execute_chain(&req, peer, &route.plugins).await {
            PluginAction::Continue => {}
            PluginAction::Halt(response) => return response,
        }

        self.proxy.forward(req, route, peer).await
    }
}

#[axum::debug_handler]
async fn proxy_request(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    gateway.handle(req, peer).await
}

/// `GET /healthz`: every service's instance statuses.
async fn healthz(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(gateway.health.all_statuses())
}

/// `GET /circuit-breaker/status`: snapshot of all breakers.
async fn circuit_status(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "circuits": gateway.breakers.all_states(),
    }))
}

#[derive(Debug, Deserialize)]
struct ResetQuery {
    service: Option<String>,
}

/// `POST /circuit-breaker/reset?service=<name>`.
async fn circuit_reset(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<ResetQuery>,
) -> Response {
    let service = match query.service {
        Some(service) if !service.is_empty() => service,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "message": "missing 'service' query parameter",
                })),
            )
                .into_response()
        }
    };

    match gateway.breakers.reset(&service) {
        Ok(()) => Json(json!({
            "status": "ok",
            "message": "circuit breaker reset",
            "service": service,
        }))
        .into_response(),
        Err(error) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "message": error.to_string(),
                "service": service,
            })),
        )
            .into_response(),
    }
}
