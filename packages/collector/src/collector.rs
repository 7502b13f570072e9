//! Control-plane façade.
//!
//! [`Collector`] wires one [`ConnectionManager`] and one [`ScrapeManager`]
//! over shared storage and exposes the operations an API layer needs.
//! Construct it once per process and share it by reference.

use futures::Stream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::CollectorSettings;
use crate::connection::{ConnectionManager, ConnectionStatus, GuardedClient, InitOutcome, LoginEvent};
use crate::crawl::{CollectorService, FinishedScrape, ScrapeJob, ScrapeManager, ScrapeOptions, ScrapeRequest};
use crate::error::Result;
use crate::ratelimit::RateLimiter;
use crate::traits::protocol::{ClientFactory, LoginClientFactory};
use crate::traits::publisher::EventPublisher;
use crate::traits::store::CollectorStore;
use crate::types::Topic;

/// The collector's control plane.
pub struct Collector {
    connection: Arc<ConnectionManager>,
    scrapes: ScrapeManager,
}

impl Collector {
    pub fn new<S>(
        store: Arc<S>,
        publisher: Arc<dyn EventPublisher>,
        client_factory: Arc<dyn ClientFactory>,
        login_factory: Arc<dyn LoginClientFactory>,
        settings: CollectorSettings,
    ) -> Result<Self>
    where
        S: CollectorStore + 'static,
    {
        let limiter = Arc::new(RateLimiter::from_settings(&settings.rate_limit)?);
        let connection = Arc::new(ConnectionManager::new(
            store.clone(),
            client_factory,
            login_factory,
        ));
        let service = CollectorService::new(
            GuardedClient::new(Arc::clone(&connection), limiter),
            store,
            publisher,
            settings.scrape,
        );

        Ok(Self {
            connection,
            scrapes: ScrapeManager::new(Arc::new(service)),
        })
    }

    /// Restore the stored session, if any.
    pub async fn init(&self) -> InitOutcome {
        self.connection.init().await
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Start a background crawl.
    pub fn start_crawl(&self, options: ScrapeOptions) -> Result<ScrapeJob> {
        self.scrapes.start(options)
    }

    /// Validate an API request and start a background crawl.
    pub fn start_crawl_request(&self, request: ScrapeRequest) -> Result<ScrapeJob> {
        self.scrapes.start(request.into_options()?)
    }

    pub fn stop_crawl(&self) {
        self.scrapes.stop();
    }

    pub fn current_crawl(&self) -> Option<ScrapeJob> {
        self.scrapes.current()
    }

    pub fn last_crawl_result(&self) -> Option<FinishedScrape> {
        self.scrapes.last_result()
    }

    /// Wait for the running crawl, if any, to finish.
    pub async fn wait_crawl_idle(&self) {
        self.scrapes.wait_idle().await;
    }

    pub async fn list_topics(&self, cancel: &CancellationToken, channel: &str) -> Result<Vec<Topic>> {
        self.scrapes.list_topics(cancel, channel).await
    }

    /// Run a QR login, reporting each login URL through `on_token`.
    pub async fn start_login<F>(&self, cancel: &CancellationToken, on_token: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync,
    {
        self.connection.start_qr(cancel, on_token).await
    }

    /// Run a QR login in the background and stream its progress.
    pub fn login_events(&self, cancel: CancellationToken) -> impl Stream<Item = LoginEvent> + Send + 'static {
        self.connection.login_events(cancel)
    }

    pub fn is_login_in_progress(&self) -> bool {
        self.connection.is_qr_in_progress()
    }

    pub fn cancel_login(&self) -> bool {
        self.connection.cancel_qr()
    }

    /// Stop the crawl, abandon any login and disconnect.
    pub async fn shutdown(&self) {
        self.scrapes.stop();
        self.connection.cancel_qr();
        self.connection.stop().await;
        info!("Collector shut down");
    }
}

/// Production storage and event sink built from [`Config`](crate::config::Config).
#[cfg(all(feature = "postgres", feature = "nats"))]
pub struct Backends {
    pub store: Arc<crate::stores::PostgresStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

#[cfg(all(feature = "postgres", feature = "nats"))]
impl Backends {
    /// Connect to PostgreSQL and NATS.
    pub async fn connect(config: &crate::config::Config) -> Result<Self> {
        use crate::publishers::{JobEventPublisher, NatsClientPublisher};

        let store = crate::stores::PostgresStore::new(&config.database_url).await?;
        info!("Database connected");

        let nats = NatsClientPublisher::connect(&config.nats_url).await?;
        info!(url = %config.nats_url, "NATS connected");

        Ok(Self {
            store: Arc::new(store),
            publisher: Arc::new(JobEventPublisher::with_subject(nats, config.jobs_new_subject.clone())),
        })
    }
}
