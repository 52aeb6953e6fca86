//! Service wiring for the flow-orchestration core.
//!
//! Chooses storage and streamer backends from the environment, bundles them
//! with the flow runtime, and owns per-workspace background schedules.

pub mod config;
pub mod service;
pub mod telemetry;

pub use config::{ServiceConfig, StorageKind, StreamerKind};
pub use service::Service;
pub use telemetry::init_tracing;
