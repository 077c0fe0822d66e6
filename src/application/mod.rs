//! Application layer: the request-handling pipeline.

pub mod fusion;
