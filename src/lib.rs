//! Citation fusion query service.
//!
//! Joins three read-only datasets per request: a local-identifier to DOI
//! mapping, a one-hop DOI citation graph and a metadata blob store, and
//! serves the fused document over HTTP. Expensive responses are kept in a
//! compressed on-disk cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
