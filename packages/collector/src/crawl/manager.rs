//! Single-flight crawl job manager.
//!
//! At most one crawl runs per process. [`ScrapeManager::start`] hands the
//! run to a spawned task with its own root cancellation token, so the
//! caller's request lifetime does not bound the crawl; only
//! [`ScrapeManager::stop`] does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::connection::ConnectionStatus;
use crate::crawl::request::ScrapeOptions;
use crate::error::{CollectorError, Result};
use crate::types::{ScrapeResult, Topic};

/// Runs crawls on behalf of the manager.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, cancel: &CancellationToken, opts: &ScrapeOptions) -> Result<ScrapeResult>;

    async fn list_topics(&self, cancel: &CancellationToken, channel: &str) -> Result<Vec<Topic>>;

    fn connection_status(&self) -> ConnectionStatus;
}

/// Handle of a running crawl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub target_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub options: ScrapeOptions,
}

/// Summary of a finished crawl.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedScrape {
    pub job: ScrapeJob,
    pub finished_at: DateTime<Utc>,
    pub result: Option<ScrapeResult>,
    pub error: Option<String>,
}

struct RunningScrape {
    job: ScrapeJob,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ManagerState {
    current: Mutex<Option<RunningScrape>>,
    /// Most recently started finished job, keyed by start order
    last: Mutex<Option<(u64, FinishedScrape)>>,
    next_seq: AtomicU64,
    idle: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Owns the one crawl job allowed per process.
pub struct ScrapeManager {
    scraper: Arc<dyn Scraper>,
    state: Arc<ManagerState>,
}

impl ScrapeManager {
    pub fn new(scraper: Arc<dyn Scraper>) -> Self {
        Self {
            scraper,
            state: Arc::new(ManagerState::default()),
        }
    }

    /// Start a crawl in the background.
    ///
    /// Fails with [`CollectorError::AlreadyRunning`] while another crawl is
    /// active.
    pub fn start(&self, options: ScrapeOptions) -> Result<ScrapeJob> {
        options.ensure_target()?;

        let mut current = lock(&self.state.current);
        if current.is_some() {
            return Err(CollectorError::AlreadyRunning);
        }

        let job = ScrapeJob {
            id: Uuid::new_v4(),
            target_id: options.target_id,
            started_at: Utc::now(),
            options,
        };
        let seq = self.state.next_seq.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *current = Some(RunningScrape {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        drop(current);

        info!(job_id = %job.id, channel = %job.options.channel, "Scrape job started");

        let scraper = Arc::clone(&self.scraper);
        let state = Arc::clone(&self.state);
        let running = job.clone();
        tokio::spawn(async move {
            let outcome = scraper.scrape(&cancel, &running.options).await;
            let finished = match outcome {
                Ok(result) => {
                    info!(job_id = %running.id, new_jobs = result.new_jobs, "Scrape job finished");
                    FinishedScrape {
                        job: running.clone(),
                        finished_at: Utc::now(),
                        result: Some(result),
                        error: None,
                    }
                }
                Err(e) => {
                    error!(job_id = %running.id, error = %e, "Scrape job failed");
                    FinishedScrape {
                        job: running.clone(),
                        finished_at: Utc::now(),
                        result: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            {
                // A stopped job may outlive its successor.
                let mut last = lock(&state.last);
                if last.as_ref().map_or(true, |(recorded, _)| *recorded < seq) {
                    *last = Some((seq, finished));
                }
            }

            {
                let mut current = lock(&state.current);
                if current.as_ref().is_some_and(|r| r.job.id == running.id) {
                    *current = None;
                }
            }
            state.idle.notify_waiters();
        });

        Ok(job)
    }

    /// Cancel the running crawl, if any. Idempotent.
    pub fn stop(&self) {
        if let Some(running) = lock(&self.state.current).take() {
            running.cancel.cancel();
            info!(job_id = %running.job.id, "Scrape job stopped");
        }
        self.state.idle.notify_waiters();
    }

    pub fn current(&self) -> Option<ScrapeJob> {
        lock(&self.state.current).as_ref().map(|r| r.job.clone())
    }

    /// Outcome of the most recently finished crawl.
    pub fn last_result(&self) -> Option<FinishedScrape> {
        lock(&self.state.last)
            .as_ref()
            .map(|(_, finished)| finished.clone())
    }

    /// Wait until no crawl is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.state.current).is_none() {
                return;
            }
            notified.await;
        }
    }

    pub async fn list_topics(&self, cancel: &CancellationToken, channel: &str) -> Result<Vec<Topic>> {
        self.scraper.list_topics(cancel, channel).await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.scraper.connection_status()
    }
}
