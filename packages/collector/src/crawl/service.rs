//! Incremental crawl of one target.
//!
//! A run resolves the target and its channel, builds a [`MessageFilter`]
//! from the stored watermark, then pages backwards through history. Every
//! message is classified as already processed, empty, older than the
//! cutoff, or new; new ones become job records and `jobs.new` events. The
//! watermark is widened once the loop ends.
//!
//! Only problems a caller can act on are returned as errors. Fetch failures
//! end the loop and are counted, bookkeeping and publish failures are
//! logged.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ScrapeSettings;
use crate::connection::{ConnectionStatus, GuardedClient};
use crate::crawl::manager::Scraper;
use crate::crawl::request::ScrapeOptions;
use crate::dedup::{FilterPolicy, MessageFilter};
use crate::error::{CollectorError, Result};
use crate::traits::publisher::EventPublisher;
use crate::traits::store::CollectorStore;
use crate::types::{Channel, JobNewEvent, Message, NewJob, NewTarget, ScrapeResult, Target, TargetType, Topic};

/// Largest page requested from the server.
pub const MAX_BATCH_SIZE: u64 = 100;

/// Public link to a message, `https://t.me/<channel>/<id>`.
pub fn build_source_url(channel: &str, message_id: i64) -> String {
    let channel = channel
        .trim_start_matches("https://t.me/")
        .trim_start_matches("http://t.me/")
        .trim_start_matches('@');
    format!("https://t.me/{channel}/{message_id}")
}

#[derive(Debug, Clone, Copy)]
enum Source {
    History,
    Topic(i64),
}

struct RunContext<'a> {
    target: &'a Target,
    channel: &'a Channel,
    filter: &'a MessageFilter,
    opts: &'a ScrapeOptions,
    /// Topic runs leave jobs outside the watermark, so candidates are
    /// checked against stored jobs before insert.
    check_existing: bool,
}

#[derive(Default)]
struct CrawlRun {
    result: ScrapeResult,
    min_seen: Option<i64>,
    max_seen: Option<i64>,
    /// Ids handled earlier in this run
    handled: HashSet<i64>,
    cancelled: bool,
}

impl CrawlRun {
    fn observe(&mut self, id: i64) {
        self.min_seen = Some(self.min_seen.map_or(id, |m| m.min(id)));
        self.max_seen = Some(self.max_seen.map_or(id, |m| m.max(id)));
    }

    fn limit_reached(&self, limit: Option<u64>) -> bool {
        limit.is_some_and(|limit| self.result.total_fetched >= limit)
    }
}

/// Crawls targets through the guarded protocol client.
pub struct CollectorService {
    client: GuardedClient,
    store: Arc<dyn CollectorStore>,
    publisher: Arc<dyn EventPublisher>,
    settings: ScrapeSettings,
}

impl CollectorService {
    pub fn new(
        client: GuardedClient,
        store: Arc<dyn CollectorStore>,
        publisher: Arc<dyn EventPublisher>,
        settings: ScrapeSettings,
    ) -> Self {
        Self {
            client,
            store,
            publisher,
            settings,
        }
    }

    /// Run one crawl to completion or cancellation.
    ///
    /// A cancelled run returns the partial tally, not an error.
    pub async fn scrape(&self, cancel: &CancellationToken, opts: &ScrapeOptions) -> Result<ScrapeResult> {
        opts.ensure_target()?;

        let target = self.resolve_target(opts).await?;
        info!(target_id = %target.id, channel = %target.url, "Starting scrape");

        let channel = self.client.resolve_channel(cancel, &target.url).await?;
        debug!(
            channel_id = channel.id,
            is_forum = channel.is_forum,
            "Channel resolved"
        );

        if let Err(e) = self
            .store
            .update_telegram_info(target.id, channel.id, channel.access_hash)
            .await
        {
            warn!(error = %e, target_id = %target.id, "Failed to store channel identifiers");
        }

        let mut target_type = target.target_type;
        if channel.is_forum && target_type == TargetType::TgChannel {
            info!(target_id = %target.id, "Channel is a forum, correcting target type");
            target_type = TargetType::TgForum;
            if let Err(e) = self.store.update_target_type(target.id, target_type).await {
                warn!(error = %e, target_id = %target.id, "Failed to update target type");
            }
        }

        if !opts.topic_ids.is_empty() {
            self.check_topics(cancel, &channel, target_type, &opts.topic_ids)
                .await?;
        }

        let filter = self.build_filter(&target).await?;
        debug!(range = %filter.range(), "Dedup filter ready");

        let ctx = RunContext {
            target: &target,
            channel: &channel,
            filter: &filter,
            opts,
            check_existing: target_type == TargetType::TgForum,
        };
        let mut run = CrawlRun::default();

        if opts.topic_ids.is_empty() {
            self.crawl_source(cancel, &ctx, Source::History, &mut run).await;
        } else {
            for &topic_id in &opts.topic_ids {
                if run.cancelled || run.limit_reached(opts.limit) {
                    break;
                }
                self.crawl_source(cancel, &ctx, Source::Topic(topic_id), &mut run)
                    .await;
            }
        }

        self.finish(&target, &run, !opts.topic_ids.is_empty()).await;

        info!(
            target_id = %target.id,
            total_fetched = run.result.total_fetched,
            new_jobs = run.result.new_jobs,
            skipped_old = run.result.skipped_old,
            skipped_empty = run.result.skipped_empty,
            errors = run.result.errors,
            cancelled = run.cancelled,
            "Scrape finished"
        );
        Ok(run.result)
    }

    /// Topics of a forum channel; empty for ordinary channels.
    pub async fn list_topics(&self, cancel: &CancellationToken, channel: &str) -> Result<Vec<Topic>> {
        let channel = self
            .client
            .resolve_channel(cancel, channel.trim_start_matches('@'))
            .await?;
        self.client.get_topics(cancel, &channel).await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.client.status()
    }

    async fn resolve_target(&self, opts: &ScrapeOptions) -> Result<Target> {
        if let Some(id) = opts.target_id {
            return self
                .store
                .get_target(id)
                .await?
                .ok_or(CollectorError::TargetNotFound { id });
        }

        let channel = opts.channel.trim_start_matches('@');
        if let Some(target) = self.store.get_target_by_url(channel).await? {
            return Ok(target);
        }

        info!(channel = %channel, "Creating target");
        self.store.create_target(NewTarget::channel(channel)).await
    }

    async fn check_topics(
        &self,
        cancel: &CancellationToken,
        channel: &Channel,
        target_type: TargetType,
        topic_ids: &[i64],
    ) -> Result<()> {
        if target_type != TargetType::TgForum {
            return Err(CollectorError::TopicsForForumOnly);
        }
        let known: HashSet<i64> = self
            .client
            .get_topics(cancel, channel)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if topic_ids.iter().any(|id| !known.contains(id)) {
            return Err(CollectorError::TopicNotFound);
        }
        Ok(())
    }

    async fn build_filter(&self, target: &Target) -> Result<MessageFilter> {
        let range = self.store.get_range(target.id).await?;
        match self.settings.filter_policy {
            FilterPolicy::Range => Ok(MessageFilter::Range(range)),
            FilterPolicy::Smart => {
                let existing = if range.is_empty() {
                    HashSet::new()
                } else {
                    self.store
                        .existing_message_ids(target.id, range.min_id, range.max_id)
                        .await?
                };
                Ok(MessageFilter::Smart { range, existing })
            }
        }
    }

    async fn crawl_source(
        &self,
        cancel: &CancellationToken,
        ctx: &RunContext<'_>,
        source: Source,
        run: &mut CrawlRun,
    ) {
        let mut offset_id = 0;

        for batch in 1..=self.settings.max_batches {
            if cancel.is_cancelled() {
                info!(batch, "Scrape cancelled");
                run.cancelled = true;
                return;
            }

            let page_size = match ctx.opts.limit {
                Some(limit) => limit
                    .saturating_sub(run.result.total_fetched)
                    .min(MAX_BATCH_SIZE),
                None => MAX_BATCH_SIZE,
            };
            if page_size == 0 {
                return;
            }

            let fetched = match source {
                Source::History => {
                    self.client
                        .get_messages(cancel, ctx.channel, offset_id, page_size as usize)
                        .await
                }
                Source::Topic(topic_id) => {
                    self.client
                        .get_topic_messages(cancel, ctx.channel, topic_id, offset_id, page_size as usize)
                        .await
                }
            };
            let messages = match fetched {
                Ok(messages) => messages,
                Err(e) if e.is_cancelled() => {
                    info!(batch, "Scrape cancelled during fetch");
                    run.cancelled = true;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, batch, offset_id, ?source, "Fetch failed, stopping");
                    run.result.errors += 1;
                    return;
                }
            };

            if messages.is_empty() {
                debug!(batch, ?source, "No more messages");
                return;
            }

            run.result.batches += 1;
            run.result.total_fetched += messages.len() as u64;
            for message in &messages {
                self.process_message(ctx, message, run).await;
            }
            debug!(
                batch,
                received = messages.len(),
                new_jobs = run.result.new_jobs,
                "Batch processed"
            );

            let next_offset = messages.last().map_or(offset_id, |m| m.id);
            if next_offset == offset_id {
                warn!(offset_id, "Offset did not advance, stopping");
                return;
            }
            offset_id = next_offset;

            if run.limit_reached(ctx.opts.limit) {
                debug!(total_fetched = run.result.total_fetched, "Fetch limit reached");
                return;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(batch, "Scrape cancelled");
                    run.cancelled = true;
                    return;
                }
                _ = tokio::time::sleep(self.settings.batch_delay) => {}
            }
        }

        warn!(
            max_batches = self.settings.max_batches,
            ?source,
            "Reached batch limit, stopping"
        );
    }

    async fn process_message(&self, ctx: &RunContext<'_>, message: &Message, run: &mut CrawlRun) {
        run.observe(message.id);

        if !run.handled.insert(message.id) || !ctx.filter.is_new(message) {
            run.result.skipped_old += 1;
            return;
        }

        if ctx.check_existing {
            match self
                .store
                .job_exists(ctx.target.id, &message.id.to_string())
                .await
            {
                Ok(true) => {
                    run.result.skipped_old += 1;
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, message_id = message.id, "Failed to check for existing job");
                }
            }
        }

        if message.is_empty() {
            run.result.skipped_empty += 1;
            return;
        }

        if ctx.opts.until.is_some_and(|until| message.date < until) {
            run.result.skipped_outdated += 1;
            return;
        }

        let job = NewJob {
            target_id: ctx.target.id,
            external_id: message.id.to_string(),
            raw_content: message.text.clone(),
            source_url: Some(build_source_url(&ctx.target.url, message.id)),
            source_date: Some(message.date),
            tg_message_id: Some(message.id),
            tg_topic_id: message.topic_id,
        };

        let job = match self.store.create_job(job).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, message_id = message.id, "Failed to create job");
                run.result.errors += 1;
                return;
            }
        };
        run.result.new_jobs += 1;

        if let Err(e) = self.publisher.publish_job_new(&JobNewEvent::from(&job)).await {
            warn!(error = %e, job_id = %job.id, "Failed to publish job event");
        }
    }

    /// Topic-scoped runs only cover part of the id space and never move the
    /// watermark or the newest-message marker.
    async fn finish(&self, target: &Target, run: &CrawlRun, topic_scoped: bool) {
        if topic_scoped {
            debug!(target_id = %target.id, "Topic crawl, watermark unchanged");
        } else if let (Some(min_id), Some(max_id)) = (run.min_seen, run.max_seen) {
            if max_id > 0 {
                if let Err(e) = self.store.upsert_range(target.id, min_id, max_id).await {
                    warn!(error = %e, target_id = %target.id, "Failed to update parsed range");
                }
            }
        }

        let last_message_id = if topic_scoped { None } else { run.max_seen };
        if let Err(e) = self.store.update_last_scraped(target.id, last_message_id).await {
            warn!(error = %e, target_id = %target.id, "Failed to update last scraped");
        }
    }
}

#[async_trait]
impl Scraper for CollectorService {
    async fn scrape(&self, cancel: &CancellationToken, opts: &ScrapeOptions) -> Result<ScrapeResult> {
        CollectorService::scrape(self, cancel, opts).await
    }

    async fn list_topics(&self, cancel: &CancellationToken, channel: &str) -> Result<Vec<Topic>> {
        CollectorService::list_topics(self, cancel, channel).await
    }

    fn connection_status(&self) -> ConnectionStatus {
        CollectorService::connection_status(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::dedup::ParsedRange;
    use crate::publishers::JobEventPublisher;
    use crate::ratelimit::RateLimiter;
    use crate::stores::MemoryStore;
    use crate::testing::{
        message, message_at, sample_channel, sample_forum, sample_session_data, MockClientFactory,
        MockLoginFactory, MockProtocolClient, TestNats,
    };
    use crate::traits::store::{
        JobStore, MockJobStore, MockRangeStore, MockTargetStore, RangeStore, SessionStore, TargetStore,
    };
    use crate::types::{Job, Session, Topic};
    use uuid::Uuid;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    struct Harness {
        service: CollectorService,
        store: Arc<MemoryStore>,
        nats: Arc<TestNats>,
        client: Arc<MockProtocolClient>,
    }

    fn fast_settings(policy: FilterPolicy) -> ScrapeSettings {
        ScrapeSettings {
            batch_delay: Duration::from_millis(1),
            max_batches: 100,
            filter_policy: policy,
        }
    }

    async fn harness_with(client: MockProtocolClient, nats: TestNats, settings: ScrapeSettings) -> Harness {
        let client = Arc::new(client);
        let store = Arc::new(MemoryStore::with_session(
            Session::from_data(&sample_session_data()).unwrap(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            store.clone(),
            Arc::new(MockClientFactory::connecting(client.clone())),
            Arc::new(MockLoginFactory::pending(vec![])),
        ));
        connection.init().await;

        let nats = Arc::new(nats);
        let limiter = Arc::new(RateLimiter::new(1_000.0, 100).unwrap());
        let service = CollectorService::new(
            GuardedClient::new(connection, limiter),
            store.clone(),
            Arc::new(JobEventPublisher::new(nats.clone())),
            settings,
        );
        Harness {
            service,
            store,
            nats,
            client,
        }
    }

    async fn harness(client: MockProtocolClient) -> Harness {
        harness_with(client, TestNats::new(), fast_settings(FilterPolicy::Smart)).await
    }

    fn channel_opts(channel: &str) -> ScrapeOptions {
        ScrapeOptions::builder().channel(channel).build()
    }

    #[test]
    fn source_url_normalizes_channel() {
        assert_eq!(build_source_url("rust_jobs", 5), "https://t.me/rust_jobs/5");
        assert_eq!(build_source_url("@rust_jobs", 5), "https://t.me/rust_jobs/5");
        assert_eq!(build_source_url("https://t.me/rust_jobs", 5), "https://t.me/rust_jobs/5");
        assert_eq!(build_source_url("http://t.me/rust_jobs", 5), "https://t.me/rust_jobs/5");
    }

    #[tokio::test]
    async fn first_crawl_creates_jobs_and_watermark() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages(
                    "rust_jobs",
                    vec![message(100, "senior rust", 1), message(101, "", 1), message(102, "junior rust", 1)],
                ),
        )
        .await;

        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("@rust_jobs"))
            .await
            .unwrap();

        assert_eq!(result.total_fetched, 3);
        assert_eq!(result.new_jobs, 2);
        assert_eq!(result.skipped_empty, 1);
        assert_eq!(h.nats.messages_for_subject("jobs.new").len(), 2);

        let target = h.store.get_target_by_url("rust_jobs").await.unwrap().unwrap();
        assert_eq!(target.target_type, TargetType::TgChannel);
        assert_eq!(target.tg_channel_id, Some(sample_channel("rust_jobs").id));
        assert_eq!(target.last_message_id, Some(102));
        assert_eq!(
            h.store.get_range(target.id).await.unwrap(),
            ParsedRange::new(100, 102)
        );

        let job = h.store.jobs().into_iter().find(|j| j.external_id == "102").unwrap();
        assert_eq!(job.source_url.as_deref(), Some("https://t.me/rust_jobs/102"));
        assert_eq!(job.tg_message_id, Some(102));
    }

    #[tokio::test]
    async fn second_crawl_skips_processed_ids() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages("rust_jobs", vec![message(100, "a", 1), message(101, "b", 1)]),
        )
        .await;
        let opts = channel_opts("rust_jobs");
        h.service.scrape(&CancellationToken::new(), &opts).await.unwrap();

        h.client.set_messages(
            "rust_jobs",
            vec![message(100, "a", 1), message(101, "b", 1), message(102, "c", 0)],
        );
        let result = h.service.scrape(&CancellationToken::new(), &opts).await.unwrap();

        assert_eq!(result.new_jobs, 1);
        assert_eq!(result.skipped_old, 2);
        assert_eq!(h.nats.published_messages().len(), 3);
        assert_eq!(h.store.target_count(), 1);
    }

    #[tokio::test]
    async fn smart_policy_backfills_gaps_inside_range() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages("rust_jobs", vec![message(10, "a", 1), message(11, "b", 1), message(12, "c", 1)]),
        )
        .await;
        let target = h
            .store
            .create_target(NewTarget::channel("rust_jobs"))
            .await
            .unwrap();
        // Watermark claims 10..12 but only 10 has a job.
        h.store.upsert_range(target.id, 10, 12).await.unwrap();
        h.store
            .create_job(NewJob {
                target_id: target.id,
                external_id: "10".into(),
                raw_content: "a".into(),
                source_url: None,
                source_date: None,
                tg_message_id: Some(10),
                tg_topic_id: None,
            })
            .await
            .unwrap();

        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("rust_jobs"))
            .await
            .unwrap();
        assert_eq!(result.new_jobs, 2);
        assert_eq!(result.skipped_old, 1);
    }

    #[tokio::test]
    async fn range_policy_trusts_watermark() {
        let h = harness_with(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages("rust_jobs", vec![message(10, "a", 1), message(11, "b", 1), message(13, "d", 1)]),
            TestNats::new(),
            fast_settings(FilterPolicy::Range),
        )
        .await;
        let target = h
            .store
            .create_target(NewTarget::channel("rust_jobs"))
            .await
            .unwrap();
        h.store.upsert_range(target.id, 10, 12).await.unwrap();

        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("rust_jobs"))
            .await
            .unwrap();
        assert_eq!(result.new_jobs, 1);
        assert_eq!(result.skipped_old, 2);
    }

    #[tokio::test]
    async fn pages_through_history_with_limit() {
        let history: Vec<Message> = (1..=250).map(|id| message(id, "post", 1)).collect();
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("big"))
                .with_messages("big", history),
        )
        .await;

        let opts = ScrapeOptions::builder().channel("big").limit(150).build();
        let result = h.service.scrape(&CancellationToken::new(), &opts).await.unwrap();

        assert_eq!(result.total_fetched, 150);
        assert_eq!(result.batches, 2);
        let calls = h.client.calls();
        assert!(calls.contains(&"get_messages(big,0,100)".to_string()));
        assert!(calls.contains(&"get_messages(big,151,50)".to_string()));

        let target = h.store.get_target_by_url("big").await.unwrap().unwrap();
        assert_eq!(
            h.store.get_range(target.id).await.unwrap(),
            ParsedRange::new(101, 250)
        );
    }

    #[tokio::test]
    async fn full_history_without_limit() {
        let history: Vec<Message> = (1..=230).map(|id| message(id, "post", 1)).collect();
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("big"))
                .with_messages("big", history),
        )
        .await;
        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("big"))
            .await
            .unwrap();
        assert_eq!(result.total_fetched, 230);
        assert_eq!(result.new_jobs, 230);
        assert_eq!(result.batches, 3);
    }

    #[tokio::test]
    async fn until_drops_older_messages() {
        let cutoff = Utc::now() - ChronoDuration::days(7);
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages(
                    "rust_jobs",
                    vec![
                        message_at(1, "old", cutoff - ChronoDuration::seconds(1)),
                        message_at(2, "at cutoff", cutoff),
                        message(3, "new", 1),
                    ],
                ),
        )
        .await;
        let opts = ScrapeOptions::builder()
            .channel("rust_jobs")
            .until(cutoff)
            .build();
        let result = h.service.scrape(&CancellationToken::new(), &opts).await.unwrap();
        assert_eq!(result.new_jobs, 2);
        assert_eq!(result.skipped_outdated, 1);

        let mut ids: Vec<String> = h.store.jobs().into_iter().map(|j| j.external_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn fetch_error_is_counted_not_returned() {
        let client = MockProtocolClient::new()
            .with_channel(sample_channel("rust_jobs"))
            .with_messages("rust_jobs", vec![message(1, "a", 1)]);
        client.fail_next_fetch(crate::error::ProtocolError::Rpc("INTERNAL".into()));
        let h = harness(client).await;

        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("rust_jobs"))
            .await
            .unwrap();
        assert_eq!(result.errors, 1);
        assert_eq!(result.total_fetched, 0);

        // Nothing observed, so no watermark.
        let target = h.store.get_target_by_url("rust_jobs").await.unwrap().unwrap();
        assert!(h.store.get_range(target.id).await.unwrap().is_empty());
        assert!(target.last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn publish_failures_do_not_fail_scrape() {
        let h = harness_with(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages("rust_jobs", vec![message(1, "a", 1)]),
            TestNats::failing(),
            fast_settings(FilterPolicy::Smart),
        )
        .await;
        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("rust_jobs"))
            .await
            .unwrap();
        assert_eq!(result.new_jobs, 1);
        assert_eq!(result.errors, 0);
        assert_eq!(h.store.job_count(), 1);
    }

    /// Store whose target, range and job halves are mockall doubles.
    struct ScriptedStore {
        targets: MockTargetStore,
        ranges: MockRangeStore,
        jobs: MockJobStore,
    }

    #[async_trait]
    impl SessionStore for ScriptedStore {
        async fn load_session(&self) -> Result<Option<Session>> {
            Ok(None)
        }

        async fn save_session(&self, _session: &Session) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TargetStore for ScriptedStore {
        async fn get_target(&self, id: Uuid) -> Result<Option<Target>> {
            self.targets.get_target(id).await
        }

        async fn get_target_by_url(&self, url: &str) -> Result<Option<Target>> {
            self.targets.get_target_by_url(url).await
        }

        async fn create_target(&self, target: NewTarget) -> Result<Target> {
            self.targets.create_target(target).await
        }

        async fn update_telegram_info(&self, id: Uuid, channel_id: i64, access_hash: i64) -> Result<()> {
            self.targets.update_telegram_info(id, channel_id, access_hash).await
        }

        async fn update_last_scraped(&self, id: Uuid, last_message_id: Option<i64>) -> Result<()> {
            self.targets.update_last_scraped(id, last_message_id).await
        }

        async fn update_target_type(&self, id: Uuid, target_type: TargetType) -> Result<()> {
            self.targets.update_target_type(id, target_type).await
        }
    }

    #[async_trait]
    impl RangeStore for ScriptedStore {
        async fn get_range(&self, target_id: Uuid) -> Result<ParsedRange> {
            self.ranges.get_range(target_id).await
        }

        async fn upsert_range(&self, target_id: Uuid, min_id: i64, max_id: i64) -> Result<()> {
            self.ranges.upsert_range(target_id, min_id, max_id).await
        }
    }

    #[async_trait]
    impl JobStore for ScriptedStore {
        async fn create_job(&self, job: NewJob) -> Result<Job> {
            self.jobs.create_job(job).await
        }

        async fn job_exists(&self, target_id: Uuid, external_id: &str) -> Result<bool> {
            self.jobs.job_exists(target_id, external_id).await
        }

        async fn existing_message_ids(&self, target_id: Uuid, min_id: i64, max_id: i64) -> Result<HashSet<i64>> {
            self.jobs.existing_message_ids(target_id, min_id, max_id).await
        }
    }

    fn storage_failure(what: &str) -> CollectorError {
        CollectorError::Storage(format!("{what} unavailable").into())
    }

    /// Every lookup misses, so the run creates a fresh channel target.
    fn new_target_store() -> MockTargetStore {
        let mut targets = MockTargetStore::new();
        targets.expect_get_target_by_url().returning(|_| Ok(None));
        targets
            .expect_create_target()
            .returning(|target| Ok(target.into_target()));
        targets
    }

    fn empty_range_store() -> MockRangeStore {
        let mut ranges = MockRangeStore::new();
        ranges
            .expect_get_range()
            .returning(|_| Ok(ParsedRange::default()));
        ranges
    }

    async fn scripted_service(client: MockProtocolClient, store: ScriptedStore, nats: Arc<TestNats>) -> CollectorService {
        let sessions = Arc::new(MemoryStore::with_session(
            Session::from_data(&sample_session_data()).unwrap(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            sessions,
            Arc::new(MockClientFactory::connecting(Arc::new(client))),
            Arc::new(MockLoginFactory::pending(vec![])),
        ));
        connection.init().await;

        CollectorService::new(
            GuardedClient::new(connection, Arc::new(RateLimiter::new(1_000.0, 100).unwrap())),
            Arc::new(store),
            Arc::new(JobEventPublisher::new(nats)),
            fast_settings(FilterPolicy::Smart),
        )
    }

    #[tokio::test]
    async fn bookkeeping_failures_keep_the_tally() {
        let mut targets = new_target_store();
        targets
            .expect_update_telegram_info()
            .returning(|_, _, _| Err(storage_failure("targets")));
        targets
            .expect_update_last_scraped()
            .times(1)
            .returning(|_, _| Err(storage_failure("targets")));

        let mut ranges = empty_range_store();
        ranges
            .expect_upsert_range()
            .withf(|_, min_id, max_id| *min_id == 1 && *max_id == 2)
            .times(1)
            .returning(|_, _, _| Err(storage_failure("ranges")));

        let mut jobs = MockJobStore::new();
        jobs.expect_create_job().returning(|job| Ok(job.into_job()));

        let store = ScriptedStore {
            targets,
            ranges,
            jobs,
        };

        let nats = Arc::new(TestNats::new());
        let service = scripted_service(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages("rust_jobs", vec![message(1, "a", 1), message(2, "b", 1)]),
            store,
            nats.clone(),
        )
        .await;

        let result = service
            .scrape(&CancellationToken::new(), &channel_opts("rust_jobs"))
            .await
            .unwrap();
        assert_eq!(result.new_jobs, 2);
        assert_eq!(result.errors, 0);
        assert_eq!(nats.published_messages().len(), 2);
    }

    #[tokio::test]
    async fn failed_job_insert_is_counted_and_loop_continues() {
        let mut targets = new_target_store();
        targets
            .expect_update_telegram_info()
            .returning(|_, _, _| Ok(()));
        targets.expect_update_last_scraped().returning(|_, _| Ok(()));

        let mut ranges = empty_range_store();
        // The watermark still covers the failed id; smart policy recovers it.
        ranges
            .expect_upsert_range()
            .withf(|_, min_id, max_id| *min_id == 1 && *max_id == 3)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut jobs = MockJobStore::new();
        jobs.expect_create_job().times(3).returning(|job| {
            if job.external_id == "2" {
                Err(storage_failure("jobs"))
            } else {
                Ok(job.into_job())
            }
        });

        let store = ScriptedStore {
            targets,
            ranges,
            jobs,
        };

        let nats = Arc::new(TestNats::new());
        let service = scripted_service(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages(
                    "rust_jobs",
                    vec![message(1, "a", 1), message(2, "b", 1), message(3, "c", 1)],
                ),
            store,
            nats.clone(),
        )
        .await;

        let result = service
            .scrape(&CancellationToken::new(), &channel_opts("rust_jobs"))
            .await
            .unwrap();
        assert_eq!(result.total_fetched, 3);
        assert_eq!(result.new_jobs, 2);
        assert_eq!(result.errors, 1);

        let published: Vec<JobNewEvent> = nats
            .published_messages()
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect();
        let ids: Vec<&str> = published.iter().map(|e| e.external_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1"]);
    }

    #[tokio::test]
    async fn stuck_offset_stops_loop() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("loop"))
                .with_messages("loop", vec![message(3, "c", 1), message(2, "b", 1), message(1, "a", 1)])
                .with_ignored_offset(),
        )
        .await;
        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("loop"))
            .await
            .unwrap();
        assert_eq!(result.batches, 2);
        assert_eq!(result.new_jobs, 3);
        assert_eq!(result.skipped_old, 3);
        assert_eq!(result.errors, 0);
    }

    #[tokio::test]
    async fn max_batches_caps_run() {
        let history: Vec<Message> = (1..=250).map(|id| message(id, "post", 1)).collect();
        let mut settings = fast_settings(FilterPolicy::Smart);
        settings.max_batches = 2;
        let h = harness_with(
            MockProtocolClient::new()
                .with_channel(sample_channel("big"))
                .with_messages("big", history),
            TestNats::new(),
            settings,
        )
        .await;
        let result = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("big"))
            .await
            .unwrap();
        assert_eq!(result.batches, 2);
        assert_eq!(result.total_fetched, 200);
    }

    #[tokio::test]
    async fn cancellation_between_batches_returns_partial_result() {
        let history: Vec<Message> = (1..=250).map(|id| message(id, "post", 1)).collect();
        let mut settings = fast_settings(FilterPolicy::Smart);
        settings.batch_delay = Duration::from_secs(5);
        let h = harness_with(
            MockProtocolClient::new()
                .with_channel(sample_channel("big"))
                .with_messages("big", history),
            TestNats::new(),
            settings,
        )
        .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = h.service.scrape(&cancel, &channel_opts("big")).await.unwrap();
        assert_eq!(result.total_fetched, 100);
        assert_eq!(result.new_jobs, 100);

        let target = h.store.get_target_by_url("big").await.unwrap().unwrap();
        assert_eq!(
            h.store.get_range(target.id).await.unwrap(),
            ParsedRange::new(151, 250)
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_creates_nothing() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("rust_jobs"))
                .with_messages("rust_jobs", vec![message(1, "a", 1)]),
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = h.service.scrape(&cancel, &channel_opts("rust_jobs")).await;
        assert!(outcome.is_err_and(|e| e.is_cancelled()));
        assert_eq!(h.store.job_count(), 0);
    }

    #[tokio::test]
    async fn unknown_target_id_is_an_error() {
        let h = harness(MockProtocolClient::new()).await;
        let id = uuid::Uuid::new_v4();
        let err = h
            .service
            .scrape(&CancellationToken::new(), &ScrapeOptions::builder().target_id(id).build())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::TargetNotFound { id: got } if got == id));
    }

    #[tokio::test]
    async fn unknown_channel_is_an_error() {
        let h = harness(MockProtocolClient::new()).await;
        let err = h
            .service
            .scrape(&CancellationToken::new(), &channel_opts("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::ChannelNotFound));
    }

    #[tokio::test]
    async fn forum_channel_corrects_target_type() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_forum("forum"))
                .with_messages("forum", vec![message(1, "a", 1)]),
        )
        .await;
        h.service
            .scrape(&CancellationToken::new(), &channel_opts("forum"))
            .await
            .unwrap();
        let target = h.store.get_target_by_url("forum").await.unwrap().unwrap();
        assert_eq!(target.target_type, TargetType::TgForum);
    }

    fn topic(id: i64) -> Topic {
        Topic {
            id,
            title: format!("topic {id}"),
            top_message: id * 10,
            closed: false,
            pinned: false,
        }
    }

    #[tokio::test]
    async fn topics_require_forum() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_channel("plain"))
                .with_messages("plain", vec![message(1, "a", 1)]),
        )
        .await;
        let opts = ScrapeOptions::builder()
            .channel("plain")
            .topic_ids(vec![1])
            .build();
        assert!(matches!(
            h.service.scrape(&CancellationToken::new(), &opts).await,
            Err(CollectorError::TopicsForForumOnly)
        ));
    }

    #[tokio::test]
    async fn unknown_topic_is_rejected() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_forum("forum"))
                .with_topics("forum", vec![topic(1)]),
        )
        .await;
        let opts = ScrapeOptions::builder()
            .channel("forum")
            .topic_ids(vec![1, 2])
            .build();
        assert!(matches!(
            h.service.scrape(&CancellationToken::new(), &opts).await,
            Err(CollectorError::TopicNotFound)
        ));
    }

    #[tokio::test]
    async fn crawls_selected_topics() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_forum("forum"))
                .with_topics("forum", vec![topic(1), topic(2), topic(3)])
                .with_topic_messages("forum", 1, vec![message(10, "t1 a", 1), message(11, "t1 b", 1)])
                .with_topic_messages("forum", 2, vec![message(20, "t2 a", 1)])
                .with_topic_messages("forum", 3, vec![message(30, "t3 a", 1)]),
        )
        .await;
        let opts = ScrapeOptions::builder()
            .channel("forum")
            .topic_ids(vec![1, 2])
            .build();
        let result = h.service.scrape(&CancellationToken::new(), &opts).await.unwrap();

        assert_eq!(result.new_jobs, 3);
        let mut topics: Vec<Option<i64>> = h.store.jobs().iter().map(|j| j.tg_topic_id).collect();
        topics.sort();
        assert_eq!(topics, vec![Some(1), Some(1), Some(2)]);

        let target = h.store.get_target_by_url("forum").await.unwrap().unwrap();
        assert!(h.store.get_range(target.id).await.unwrap().is_empty());
        assert_eq!(target.last_message_id, None);
        assert!(target.last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn topic_crawls_do_not_hide_other_topics() {
        let h = harness_with(
            MockProtocolClient::new()
                .with_channel(sample_forum("forum"))
                .with_topics("forum", vec![topic(1), topic(2)])
                .with_topic_messages("forum", 1, vec![message(10, "t1 a", 1), message(20, "t1 b", 1)])
                .with_topic_messages("forum", 2, vec![message(15, "t2 a", 1)]),
            TestNats::new(),
            fast_settings(FilterPolicy::Range),
        )
        .await;
        let topic_opts = |id: i64| {
            ScrapeOptions::builder()
                .channel("forum")
                .topic_ids(vec![id])
                .build()
        };
        let cancel = CancellationToken::new();

        let first = h.service.scrape(&cancel, &topic_opts(1)).await.unwrap();
        assert_eq!(first.new_jobs, 2);

        let second = h.service.scrape(&cancel, &topic_opts(2)).await.unwrap();
        assert_eq!(second.new_jobs, 1);
        assert_eq!(second.skipped_old, 0);

        let again = h.service.scrape(&cancel, &topic_opts(1)).await.unwrap();
        assert_eq!(again.new_jobs, 0);
        assert_eq!(again.skipped_old, 2);
        assert_eq!(again.errors, 0);

        let mut ids: Vec<String> = h.store.jobs().into_iter().map(|j| j.external_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["10", "15", "20"]);
        assert_eq!(h.nats.published_messages().len(), 3);
    }

    #[tokio::test]
    async fn history_crawl_after_topic_crawl_skips_existing_jobs() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_forum("forum"))
                .with_topics("forum", vec![topic(1)])
                .with_topic_messages("forum", 1, vec![message(10, "t1 a", 1)])
                .with_messages("forum", vec![message(10, "t1 a", 1), message(11, "general", 1)]),
        )
        .await;
        let cancel = CancellationToken::new();
        let topic_run = ScrapeOptions::builder()
            .channel("forum")
            .topic_ids(vec![1])
            .build();
        h.service.scrape(&cancel, &topic_run).await.unwrap();

        let result = h.service.scrape(&cancel, &channel_opts("forum")).await.unwrap();
        assert_eq!(result.new_jobs, 1);
        assert_eq!(result.skipped_old, 1);
        assert_eq!(result.errors, 0);

        let target = h.store.get_target_by_url("forum").await.unwrap().unwrap();
        assert_eq!(h.store.get_range(target.id).await.unwrap(), ParsedRange::new(10, 11));
    }

    #[tokio::test]
    async fn lists_forum_topics() {
        let h = harness(
            MockProtocolClient::new()
                .with_channel(sample_forum("forum"))
                .with_topics("forum", vec![topic(1), topic(2)]),
        )
        .await;
        let topics = h
            .service
            .list_topics(&CancellationToken::new(), "@forum")
            .await
            .unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(h.service.connection_status(), ConnectionStatus::Ready);
    }
}
