//! Interfaces the collector consumes.
//!
//! Applications provide the remote protocol client, storage and the event
//! sink by implementing these traits; the crate ships in-memory and
//! PostgreSQL stores plus a NATS publisher.

pub mod protocol;
pub mod publisher;
pub mod store;
