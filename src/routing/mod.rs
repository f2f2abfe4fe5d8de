//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Application Begin (source, source_ref, authorization, TLS extension)
//!     → matcher.rs (RouteRequest + default / specific predicates)
//!     → router.rs (RouteTable::resolve, first match wins)
//!     → Return: matched Route or None
//! ```
//!
//! # Design Decisions
//! - Routes are immutable once the table is built
//! - Two predicates per Begin: the default one ignores protocol, the specific one honours it
//! - Hostname comparison is case-insensitive, protocol comparison is exact
//! - A route's authorization bits must all be present in the stream's authorization

pub mod matcher;
pub mod router;

pub use matcher::{DefaultRouteMatcher, RouteMatcher, RouteRequest, SpecificRouteMatcher};
pub use router::{Route, RouteTable, StaticRouteTable, TlsRouteEx};
