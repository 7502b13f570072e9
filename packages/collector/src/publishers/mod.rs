//! Event publishers.
//!
//! [`JobEventPublisher`] turns collector events into JSON payloads on a NATS
//! subject. The transport is the [`NatsPublisher`] trait so tests can swap in
//! [`TestNats`](crate::testing::TestNats).

pub mod nats;

pub use nats::{JobEventPublisher, NatsPublisher, PublishedMessage};

#[cfg(feature = "nats")]
pub use nats::NatsClientPublisher;
