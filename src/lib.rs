//! # backlog-rs
//!
//! Durable feature backlog for long-running, multi-session automated builds.
//!
//! Provides the feature model and its state machine, a store abstraction
//! with in-memory and SQLite (sqlx) backends, the engine that session
//! drivers call to fetch, complete, skip and review features, and
//! tracing/OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;
pub mod telemetry;
