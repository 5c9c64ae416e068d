//! NATS JetStream integration
//!
//! Event publishing, the command consumer, and the stream setup both rely on.

pub mod commands;
mod publisher;

pub use publisher::{ensure_streams, streams, NatsPublisher, EVENTS_SUBJECTS};
