//! Route predicates evaluated against an incoming application Begin.

use crate::routing::Route;
use crate::stream::Begin;

/// Trait for matching routes against a request.
pub trait RouteMatcher: std::fmt::Debug {
    /// Returns true if the route satisfies this predicate.
    fn matches(&self, route: &Route) -> bool;
}

/// What an application Begin asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub authorization: u64,
    pub source: String,
    pub source_ref: u64,
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
}

impl RouteRequest {
    pub fn from_begin(begin: &Begin) -> Self {
        let extension = begin.extension.as_ref();
        Self {
            authorization: begin.authorization,
            source: begin.source.clone(),
            source_ref: begin.source_ref,
            hostname: extension.and_then(|ex| ex.hostname()).map(str::to_string),
            application_protocol: extension
                .and_then(|ex| ex.application_protocol())
                .map(str::to_string),
        }
    }

    fn matches_source(&self, route: &Route) -> bool {
        route.source_ref == self.source_ref && route.source == self.source
    }

    /// An unspecified hostname matches any route; otherwise the route must name it.
    fn matches_hostname(&self, route: &Route) -> bool {
        match (&self.hostname, &route.extension.hostname) {
            (None, _) => true,
            (Some(requested), Some(routed)) => requested.eq_ignore_ascii_case(routed),
            (Some(_), None) => false,
        }
    }
}

/// Matches routes that leave the application protocol unconstrained.
#[derive(Debug)]
pub struct DefaultRouteMatcher<'a> {
    request: &'a RouteRequest,
}

impl<'a> DefaultRouteMatcher<'a> {
    pub fn new(request: &'a RouteRequest) -> Self {
        Self { request }
    }
}

impl RouteMatcher for DefaultRouteMatcher<'_> {
    fn matches(&self, route: &Route) -> bool {
        self.request.matches_source(route)
            && self.request.matches_hostname(route)
            && route.extension.application_protocol.is_none()
    }
}

/// Matches routes whose protocol, when set, equals the requested one.
#[derive(Debug)]
pub struct SpecificRouteMatcher<'a> {
    request: &'a RouteRequest,
}

impl<'a> SpecificRouteMatcher<'a> {
    pub fn new(request: &'a RouteRequest) -> Self {
        Self { request }
    }
}

impl RouteMatcher for SpecificRouteMatcher<'_> {
    fn matches(&self, route: &Route) -> bool {
        self.request.matches_source(route)
            && self.request.matches_hostname(route)
            && match &route.extension.application_protocol {
                None => true,
                Some(protocol) => self.request.application_protocol.as_ref() == Some(protocol),
            }
    }
}
