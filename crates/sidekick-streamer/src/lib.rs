//! Event streamer port and backends.
//!
//! An ordered, append-only, subscribable log of flow events and change
//! records. Two fixed consumer families exist: the browser UI (through a
//! streaming boundary layer) and internal pollers.

pub mod backend;
pub mod memory;
pub mod streamer;

pub use backend::StreamerBackend;
pub use memory::MemoryStreamer;
pub use streamer::{EventStreamer, FlowEventEnvelope, FlowEventSubscription, StreamError};
