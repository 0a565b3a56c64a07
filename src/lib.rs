//! Graph Pool: bounded worker pool for agent graph runs.

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod routes;
