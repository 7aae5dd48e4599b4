//! Cache-and-dispatch service for parsed profiling artifacts.
//!
//! A client connects, sends one request line naming a view, a file and a checksum, and receives
//! one JSON document rendered from the (possibly cached) parsed artifact before the connection is
//! closed. See [`service::ProfileService`] for the connection protocol and [`caching`] for the
//! memory-bounded cache that keeps parsed artifacts resident between requests.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod caching;
pub mod config;
pub mod loader;
pub mod logging;
pub mod memory;
pub mod request;
pub mod server;
pub mod service;
pub mod utils;
