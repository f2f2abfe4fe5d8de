//! Client-side TLS stream proxy library
//!
//! Encrypts application streams onto network streams and decrypts the network
//! replies back into application-reply streams. The core is sans-IO: the host
//! runtime feeds parsed frames to `ClientStreamFactory::handle` and delivers
//! whatever the factory emits through its `FrameSink`.

pub mod client;
pub mod config;
pub mod memory;
pub mod observability;
pub mod routing;
pub mod stream;
pub mod tls;

pub use client::ClientStreamFactory;
pub use config::schema::ProxyConfig;
pub use memory::{HeapArena, MemoryManager};
pub use routing::{RouteTable, StaticRouteTable};
pub use stream::{Frame, FrameSink};
pub use tls::{RustlsEngineFactory, TlsEngineFactory};
