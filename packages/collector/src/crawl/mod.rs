//! Crawl orchestration: requests, the per-target crawl loop and the
//! single-flight job manager.

pub mod manager;
pub mod request;
pub mod service;

pub use manager::{FinishedScrape, ScrapeJob, ScrapeManager, Scraper};
pub use request::{ScrapeOptions, ScrapeRequest};
pub use service::{build_source_url, CollectorService, MAX_BATCH_SIZE};
