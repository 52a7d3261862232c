use crate::prelude::*;

/// Standalone longest-prefix-per-host location matcher. Mirrors the matching rules
/// `ServerConfig::find_route` applies to a single already-resolved virtual host,
/// but keys routes by host so several virtual hosts can share one table.
pub struct Router {
    routes: HashMap<String, Vec<(String, Arc<RouteConfig>)>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn add_route_config(&mut self, host: &str, path: &str, route: Arc<RouteConfig>) {
        self.routes
            .entry(host.to_string())
            .or_default()
            .push((path.to_string(), route));
    }

    /// Longest-prefix match of `path` among the locations registered for `host`.
    pub fn resolve(
        &self,
        method: &Method,
        host: &str,
        path: &str,
    ) -> std::result::Result<Arc<RouteConfig>, RoutingError> {
        let entries = self.routes.get(host).ok_or(RoutingError::NotFound)?;

        let best = entries
            .iter()
            .filter(|(p, _)| {
                path == p
                    || (path.starts_with(p.as_str())
                        && (p.ends_with('/') || path[p.len()..].starts_with('/')))
            })
            .max_by_key(|(p, _)| p.len());

        match best {
            Some((_, route)) => {
                if method.is_allowed(&route.methods) {
                    Ok(Arc::clone(route))
                } else {
                    Err(RoutingError::MethodNotAllowed)
                }
            }
            None => Err(RoutingError::NotFound),
        }
    }
}

#[derive(Debug)]
pub enum RoutingError {
    NotFound,
    MethodNotAllowed,
}
