//! Asynchronous caching DNS stub resolver.
//!
//! The [`Resolver`] answers name lookups from a TTL cache, coalesces
//! concurrent lookups for the same name into a single upstream
//! transaction, and retransmits unanswered queries on a bounded budget
//! before giving up. Transports are injected through a socket factory;
//! [`connect_udp`] and [`connect_tcp`] cover the common cases, and
//! channel-backed fakes slot in for tests. Without a working transport,
//! lookups fall back to the operating system's resolver.

mod cache;
mod config;
mod error;
mod resolver;
mod socket;

pub use cache::LookupResult;
pub use config::ResolverConfig;
pub use error::LookupError;
pub use resolver::Resolver;
pub use socket::{ConnectionMode, SocketFactory, SocketResult, connect_tcp, connect_udp};
