//! tickscan backend library.
//!
//! Exposes the ingestion, tracking, and fan-out modules for the server
//! binary and the integration tests.

pub mod feeds;
pub mod hub;
pub mod input_log;
pub mod models;
pub mod proxy;
pub mod runner;
pub mod snapshot;
pub mod tracker;
