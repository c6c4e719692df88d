use axum::http::Method;
use tracing::info;

use crate::config::RouteConfig;

/// Matches incoming requests to configured route rules. Routes are sorted
/// longest-prefix-first at construction (stable for equal lengths, so the
/// configured order breaks ties) and never change afterwards.
pub struct Router {
    routes: Vec<RouteConfig>,
}

impl Router {
    pub fn new(mut routes: Vec<RouteConfig>) -> Self {
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        info!("router initialized with {} route rules", routes.len());
        Self { routes }
    }

    /// First route whose prefix matches the path and whose method filter, if
    /// any, includes the request method. `None` means 404.
    pub fn find_route(&self, method: &Method, path: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|route| {
            path.starts_with(route.path_prefix.as_str())
                && route
                    .methods
                    .as_ref()
                    .map_or(true, |methods| methods.iter().any(|m| m == method.as_str()))
        })
    }
}
