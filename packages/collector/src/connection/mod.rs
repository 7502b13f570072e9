//! Session lifecycle and guarded protocol access.

pub mod client;
pub mod manager;

pub use client::GuardedClient;
pub use manager::{ConnectionManager, ConnectionStatus, InitOutcome, LoginEvent, UnauthorizedReason};
