//! Channel Collector
//!
//! Harvests messages from channels reachable only through a stateful,
//! rate-limited, authenticated protocol session and turns them into
//! deduplicated work items for a downstream pipeline.
//!
//! # Pieces
//!
//! - [`ConnectionManager`] restores the persisted session at startup,
//!   exposes a status state machine and runs the QR login flow.
//! - [`RateLimiter`] throttles every protocol call and honours server
//!   backoff replies.
//! - [`ScrapeManager`] runs at most one crawl at a time; the crawl pages
//!   through history and classifies each message with a
//!   [`ParsedRange`] watermark.
//! - [`Collector`] ties them together behind one control-plane API.
//!
//! # Usage
//!
//! ```rust,ignore
//! use collector::{Collector, CollectorSettings, ScrapeOptions, MemoryStore};
//!
//! let collector = Collector::new(store, publisher, client_factory, login_factory,
//!     CollectorSettings::default())?;
//! collector.init().await;
//!
//! let job = collector.start_crawl(ScrapeOptions::builder().channel("rust_jobs").build())?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator interfaces (protocol client, stores, publisher)
//! - [`types`] - Domain types
//! - [`connection`] - Session lifecycle and guarded protocol access
//! - [`crawl`] - Crawl loop and job manager
//! - [`dedup`] - Range-based deduplication
//! - [`stores`] - Storage implementations (MemoryStore, PostgresStore)
//! - [`publishers`] - NATS event publishing
//! - [`testing`] - Test doubles

pub mod collector;
pub mod config;
pub mod connection;
pub mod crawl;
pub mod dedup;
pub mod error;
pub mod publishers;
pub mod ratelimit;
pub mod stores;
pub mod telemetry;
pub mod testing;
pub mod traits;
pub mod types;

pub use collector::Collector;
pub use config::{CollectorSettings, Config, RateLimitSettings, ScrapeSettings};
pub use connection::{
    ConnectionManager, ConnectionStatus, GuardedClient, InitOutcome, LoginEvent, UnauthorizedReason,
};
pub use crawl::{
    CollectorService, FinishedScrape, ScrapeJob, ScrapeManager, ScrapeOptions, ScrapeRequest, Scraper,
};
pub use dedup::{FilterPolicy, MessageFilter, ParsedRange};
pub use error::{CollectorError, ProtocolError, Result};
pub use ratelimit::RateLimiter;
pub use traits::{
    protocol::{ClientFactory, LoginClient, LoginClientFactory, ProtocolClient},
    publisher::EventPublisher,
    store::{CollectorStore, JobStore, RangeStore, SessionStore, TargetStore},
};
pub use types::{
    Channel, Job, JobNewEvent, Message, NewJob, NewTarget, ScrapeResult, Session, SessionData,
    Target, TargetType, Topic,
};

#[cfg(all(feature = "postgres", feature = "nats"))]
pub use collector::Backends;

pub use publishers::{JobEventPublisher, NatsPublisher};

#[cfg(feature = "nats")]
pub use publishers::NatsClientPublisher;

pub use stores::MemoryStore;

#[cfg(feature = "postgres")]
pub use stores::PostgresStore;
