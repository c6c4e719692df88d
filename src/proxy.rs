use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use axum::{
    body::Body,
    http::{header::HeaderName, HeaderMap, HeaderValue, Request, Uri},
    response::{IntoResponse, Response},
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::balancer::{BalancerRegistry, LoadBalancer, ServiceInstance};
use crate::breaker::CircuitBreakerService;
use crate::config::RouteConfig;
use crate::error::GatewayError;
use crate::health::HealthChecker;

/// Forwards requests to a healthy upstream instance and reports the outcome
/// to the circuit breaker.
pub struct Proxy {
    balancers: Arc<BalancerRegistry>,
    health: Arc<HealthChecker>,
    breakers: Arc<CircuitBreakerService>,
    client: reqwest::Client,
}

impl Proxy {
    pub fn new(
        balancers: Arc<BalancerRegistry>,
        health: Arc<HealthChecker>,
        breakers: Arc<CircuitBreakerService>,
    ) -> AnyResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .build()
            .context("failed to create proxy HTTP client")?;

        Ok(Self {
            balancers,
            health,
            breakers,
            client,
        })
    }

    /// Select an instance, forward the request, and feed the outcome back to
    /// the breaker. Always resolves to a response; errors become synthesized
    /// status codes.
    pub async fn forward(&self, req: Request<Body>, route: &RouteConfig, peer: SocketAddr) -> Response {
        let service = route.service_name.as_str();

        let balancer = match self.balancers.get(service) {
            Some(balancer) => balancer,
            None => {
                error!(service, "no load balancer registered for service");
                return GatewayError::ServiceNotConfigured(service.to_string()).into_response();
            }
        };

        let instance = match self.select_instance(balancer.as_ref(), service) {
            Some(instance) => instance,
            None => {
                warn!(service, "no healthy instance available");
                self.breakers.record_result(service, false);
                return GatewayError::NoHealthyInstance(service.to_string()).into_response();
            }
        };
        debug!(service, instance = %instance.url, "selected upstream instance");

        let response = match self.send_upstream(req, route, &instance, peer).await {
            Ok(response) => {
                let success = response.status().is_success();
                self.breakers.record_result(service, success);
                response
            }
            Err(error) => {
                self.breakers.record_result(service, false);
                error.into_response()
            }
        };

        // Least-connections bookkeeping; a no-op for the other policies.
        balancer.release(&instance.url);

        response
    }

    /// Walk the balancer at most once per registered instance and return the
    /// first selection the health checker vouches for.
    fn select_instance(&self, balancer: &dyn LoadBalancer, service: &str) -> Option<Arc<ServiceInstance>> {
        let registered = balancer.get_all_instances().len();

        for _ in 0..registered {
            let instance = match balancer.get_next() {
                Ok(instance) => instance,
                Err(_) => return None,
            };
            if self.health.is_instance_healthy(service, &instance.url) {
                return Some(instance);
            }
            // A skipped pick keeps its least-connections increment; releasing
            // here would restore the tie and re-select the same instance on
            // every attempt. The inflated count moves the walk along.
            warn!(service, instance = %instance.url, "skipping unhealthy instance");
        }

        None
    }

    async fn send_upstream(
        &self,
        req: Request<Body>,
        route: &RouteConfig,
        instance: &ServiceInstance,
        peer: SocketAddr,
    ) -> Result<Response, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let (parts, body) = req.into_parts();
        let target = rewrite_target(&instance.url, &route.path_prefix, &parts.uri);
        debug!(%request_id, %target, "forwarding request upstream");

        let mut headers = HeaderMap::new();
        for (name, value) in parts.headers.iter() {
            if !is_skipped_request_header(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert("x-gateway-proxy", HeaderValue::from_static("true"));
        let client_ip = peer.ip().to_string();
        if let Ok(value) = HeaderValue::from_str(&client_ip) {
            headers.insert("x-forwarded-for", value.clone());
            headers.insert("x-real-ip", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert("x-request-id", value);
        }

        let upstream = self
            .client
            .request(parts.method, &target)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|error| {
                error!(%request_id, %target, %error, "upstream request failed");
                GatewayError::Upstream(error.to_string())
            })?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(response_headers) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !is_hop_by_hop_header(name) {
                    response_headers.append(name.clone(), value.clone());
                }
            }
        }

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|error| GatewayError::Internal(format!("failed to build response: {}", error)))
    }
}

/// Strip the route prefix from the request path (an empty remainder becomes
/// `/`) and graft it onto the instance URL, keeping the query string.
fn rewrite_target(instance_url: &str, path_prefix: &str, uri: &Uri) -> String {
    let path = uri.path();
    let mut rewritten = path.strip_prefix(path_prefix).unwrap_or(path).to_string();
    if rewritten.is_empty() {
        rewritten.push('/');
    } else if !rewritten.starts_with('/') {
        rewritten.insert(0, '/');
    }

    let mut target = format!("{}{}", instance_url.trim_end_matches('/'), rewritten);
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Hop-by-hop headers plus the ones the client stack derives itself: the
/// Host comes from the instance URL and the length from the streamed body.
fn is_skipped_request_header(name: &HeaderName) -> bool {
    is_hop_by_hop_header(name) || matches!(name.as_str(), "host" | "content-length")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn strips_route_prefix() {
        assert_eq!(
            rewrite_target("http://u1", "/api/users", &uri("/api/users/42")),
            "http://u1/42"
        );
    }

    #[test]
    fn empty_remainder_becomes_root() {
        assert_eq!(rewrite_target("http://u1", "/api", &uri("/api")), "http://u1/");
    }

    #[test]
    fn query_string_is_preserved() {
        assert_eq!(
            rewrite_target("http://u1", "/a", &uri("/a/x?page=2&q=rust")),
            "http://u1/x?page=2&q=rust"
        );
    }

    #[test]
    fn trailing_slash_prefix_keeps_a_leading_slash() {
        assert_eq!(
            rewrite_target("http://u1/", "/api/", &uri("/api/users")),
            "http://u1/users"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_skipped() {
        assert!(is_hop_by_hop_header(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop_header(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop_header(&HeaderName::from_static("content-type")));

        assert!(is_skipped_request_header(&HeaderName::from_static("host")));
        assert!(!is_skipped_request_header(&HeaderName::from_static("authorization")));
    }
}
