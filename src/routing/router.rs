//! Route table and lookup.
//!
//! # Responsibilities
//! - Store routes in configuration order
//! - Resolve the first route that a predicate accepts and the authorization covers
//! - Return an explicit None rather than a silent default

use crate::config::RouteConfig;
use crate::routing::RouteMatcher;

/// TLS-specific route extension.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TlsRouteEx {
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
}

/// Immutable route from an application source to a network target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source: String,
    pub source_ref: u64,
    pub target: String,
    pub target_ref: u64,
    /// Authorization bits a stream must carry to use this route.
    pub authorization: u64,
    pub extension: TlsRouteEx,
}

impl Route {
    pub fn authorizes(&self, authorization: u64) -> bool {
        authorization & self.authorization == self.authorization
    }
}

impl From<RouteConfig> for Route {
    fn from(config: RouteConfig) -> Self {
        Self {
            source: config.source,
            source_ref: config.source_ref,
            target: config.target,
            target_ref: config.target_ref,
            authorization: config.authorization,
            extension: TlsRouteEx {
                hostname: config.hostname,
                application_protocol: config.application_protocol,
            },
        }
    }
}

/// Read-only route resolution.
pub trait RouteTable: Send + Sync + std::fmt::Debug {
    fn resolve(&self, authorization: u64, matcher: &dyn RouteMatcher) -> Option<Route>;
}

/// Route table built once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteTable {
    routes: Vec<Route>,
}

impl StaticRouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn from_config(configs: Vec<RouteConfig>) -> Self {
        Self::new(configs.into_iter().map(Route::from).collect())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteTable for StaticRouteTable {
    fn resolve(&self, authorization: u64, matcher: &dyn RouteMatcher) -> Option<Route> {
        self.routes
            .iter()
            .find(|route| route.authorizes(authorization) && matcher.matches(route))
            .cloned()
    }
}
