//! Infrastructure: storage adapters, blob access, HTTP surface, telemetry.

pub mod blob;
pub mod db;
pub mod error;
pub mod http;
pub mod stats;
pub mod telemetry;
