//! In-memory storage implementation for testing and development.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::dedup::ParsedRange;
use crate::error::{CollectorError, Result};
use crate::traits::store::{JobStore, RangeStore, SessionStore, TargetStore};
use crate::types::{Job, NewJob, NewTarget, Session, Target, TargetType};

/// In-memory storage for the session, targets, ranges and jobs.
///
/// Useful for testing and development. Not suitable for production
/// as data is lost on restart.
pub struct MemoryStore {
    session: RwLock<Option<Session>>,
    targets: RwLock<HashMap<Uuid, Target>>,
    ranges: RwLock<HashMap<Uuid, ParsedRange>>,
    jobs: RwLock<Vec<Job>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            session: RwLock::new(None),
            targets: RwLock::new(HashMap::new()),
            ranges: RwLock::new(HashMap::new()),
            jobs: RwLock::new(Vec::new()),
        }
    }

    /// Create a store that already holds a session.
    pub fn with_session(session: Session) -> Self {
        let store = Self::new();
        *write(&store.session) = Some(session);
        store
    }

    /// All stored jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        read(&self.jobs).clone()
    }

    /// Get the number of stored jobs.
    pub fn job_count(&self) -> usize {
        read(&self.jobs).len()
    }

    /// Get the number of stored targets.
    pub fn target_count(&self) -> usize {
        read(&self.targets).len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_session(&self) -> Result<Option<Session>> {
        Ok(read(&self.session).clone())
    }

    async fn save_session(&self, session: &Session) -> Result<()> {
        *write(&self.session) = Some(session.clone());
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn get_target(&self, id: Uuid) -> Result<Option<Target>> {
        Ok(read(&self.targets).get(&id).cloned())
    }

    async fn get_target_by_url(&self, url: &str) -> Result<Option<Target>> {
        Ok(read(&self.targets).values().find(|t| t.url == url).cloned())
    }

    async fn create_target(&self, target: NewTarget) -> Result<Target> {
        let mut targets = write(&self.targets);
        if targets.values().any(|t| t.url == target.url) {
            return Err(CollectorError::Storage(
                format!("target with url {} already exists", target.url).into(),
            ));
        }
        let target = target.into_target();
        targets.insert(target.id, target.clone());
        Ok(target)
    }

    async fn update_telegram_info(
        &self,
        id: Uuid,
        channel_id: i64,
        access_hash: i64,
    ) -> Result<()> {
        let mut targets = write(&self.targets);
        let target = targets
            .get_mut(&id)
            .ok_or(CollectorError::TargetNotFound { id })?;
        target.tg_channel_id = Some(channel_id);
        target.tg_access_hash = Some(access_hash);
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn update_last_scraped(&self, id: Uuid, last_message_id: Option<i64>) -> Result<()> {
        let mut targets = write(&self.targets);
        let target = targets
            .get_mut(&id)
            .ok_or(CollectorError::TargetNotFound { id })?;
        let now = Utc::now();
        target.last_scraped_at = Some(now);
        if last_message_id.is_some() {
            target.last_message_id = last_message_id;
        }
        target.updated_at = now;
        Ok(())
    }

    async fn update_target_type(&self, id: Uuid, target_type: TargetType) -> Result<()> {
        let mut targets = write(&self.targets);
        let target = targets
            .get_mut(&id)
            .ok_or(CollectorError::TargetNotFound { id })?;
        target.target_type = target_type;
        target.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RangeStore for MemoryStore {
    async fn get_range(&self, target_id: Uuid) -> Result<ParsedRange> {
        Ok(read(&self.ranges)
            .get(&target_id)
            .copied()
            .unwrap_or_default())
    }

    async fn upsert_range(&self, target_id: Uuid, min_id: i64, max_id: i64) -> Result<()> {
        write(&self.ranges)
            .entry(target_id)
            .or_default()
            .extend(min_id, max_id);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let mut jobs = write(&self.jobs);
        if jobs
            .iter()
            .any(|j| j.target_id == job.target_id && j.external_id == job.external_id)
        {
            return Err(CollectorError::Storage(
                format!("job {} already exists for target", job.external_id).into(),
            ));
        }
        let job = job.into_job();
        jobs.push(job.clone());
        Ok(job)
    }

    async fn job_exists(&self, target_id: Uuid, external_id: &str) -> Result<bool> {
        Ok(read(&self.jobs)
            .iter()
            .any(|j| j.target_id == target_id && j.external_id == external_id))
    }

    async fn existing_message_ids(
        &self,
        target_id: Uuid,
        min_id: i64,
        max_id: i64,
    ) -> Result<HashSet<i64>> {
        Ok(read(&self.jobs)
            .iter()
            .filter(|j| j.target_id == target_id)
            .filter_map(|j| j.tg_message_id)
            .filter(|id| (min_id..=max_id).contains(id))
            .collect())
    }
}
