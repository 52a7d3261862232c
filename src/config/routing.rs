use crate::config::types::{RouteConfig, ServerConfig};
use crate::http::Method;
use crate::router::RoutingError;

impl ServerConfig {
    /// Finds the route whose `path` is the longest prefix of `url`, then checks that
    /// `method` is in its allow-list. Mirrors nginx/webserv "longest matching location" semantics.
    pub fn find_route(&self, url: &str, method: &Method) -> Result<&RouteConfig, RoutingError> {
        let best = self
            .routes
            .iter()
            .filter(|r| {
                url == r.path
                    || (url.starts_with(r.path.as_str())
                        && (r.path.ends_with('/') || url[r.path.len()..].starts_with('/')))
            })
            .max_by_key(|r| r.path.len());

        match best {
            Some(route) => {
                if method.is_allowed(&route.methods) {
                    Ok(route)
                } else {
                    Err(RoutingError::MethodNotAllowed)
                }
            }
            None => Err(RoutingError::NotFound),
        }
    }

    /// Allowed-methods list of the longest-prefix location matching `url`, for building
    /// the `Allow:` header on a 405 response. Empty if no location matches at all.
    pub fn allowed_methods_for(&self, url: &str) -> Vec<String> {
        self.routes
            .iter()
            .filter(|r| {
                url == r.path
                    || (url.starts_with(r.path.as_str())
                        && (r.path.ends_with('/') || url[r.path.len()..].starts_with('/')))
            })
            .max_by_key(|r| r.path.len())
            .map(|r| r.methods.clone())
            .unwrap_or_default()
    }
}
