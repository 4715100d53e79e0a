//! Conflict and job persistence.
//!
//! The conflict store is written by running jobs and by manual review at the
//! same time. Resolution is a check-and-set on the single record, so two
//! concurrent resolutions of one conflict cannot both succeed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crm_types::{CrmError, FieldValue, ObjectType, Result};

use crate::conflict::{ConflictRecord, ConflictStatus};
use crate::job::SyncJob;

// ---------------------------------------------------------------------------
// ConflictStore
// ---------------------------------------------------------------------------

/// Filter for [`ConflictStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ConflictQuery {
    pub job_id: Option<Uuid>,
    pub status: Option<ConflictStatus>,
    pub limit: Option<usize>,
}

impl ConflictQuery {
    pub fn unresolved(limit: usize) -> Self {
        Self {
            job_id: None,
            status: Some(ConflictStatus::Unresolved),
            limit: Some(limit),
        }
    }
}

#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Store a new conflict. If one already exists for the same
    /// (job, object type, record, field), that one is returned unchanged.
    async fn insert(&self, record: ConflictRecord) -> Result<ConflictRecord>;

    async fn get(&self, id: Uuid) -> Result<Option<ConflictRecord>>;

    /// Matching records, oldest first.
    async fn list(&self, query: &ConflictQuery) -> Result<Vec<ConflictRecord>>;

    /// Resolve an unresolved conflict with an explicit value. Fails with
    /// [`CrmError::ConflictAlreadyResolved`] if it has been resolved already.
    async fn resolve(
        &self,
        id: Uuid,
        value: FieldValue,
        resolved_with: &str,
        now: DateTime<Utc>,
    ) -> Result<ConflictRecord>;
}

type ConflictKey = (Uuid, ObjectType, String, String);

/// In-process conflict store with per-record locking.
#[derive(Default)]
pub struct MemoryConflictStore {
    records: DashMap<Uuid, ConflictRecord>,
    index: DashMap<ConflictKey, Uuid>,
}

impl MemoryConflictStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ConflictStore for MemoryConflictStore {
    async fn insert(&self, record: ConflictRecord) -> Result<ConflictRecord> {
        match self.index.entry(record.key()) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                self.records
                    .get(&id)
                    .map(|r| r.clone())
                    .ok_or_else(|| CrmError::not_found("conflict", id))
            }
            Entry::Vacant(slot) => {
                self.records.insert(record.id, record.clone());
                slot.insert(record.id);
                Ok(record)
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ConflictRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn list(&self, query: &ConflictQuery) -> Result<Vec<ConflictRecord>> {
        let mut matching: Vec<ConflictRecord> = self
            .records
            .iter()
            .filter(|r| query.job_id.map_or(true, |id| r.job_id == id))
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .map(|r| r.clone())
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }

    async fn resolve(
        &self,
        id: Uuid,
        value: FieldValue,
        resolved_with: &str,
        now: DateTime<Utc>,
    ) -> Result<ConflictRecord> {
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| CrmError::not_found("conflict", id))?;
        if record.status == ConflictStatus::Resolved {
            return Err(CrmError::ConflictAlreadyResolved { id: id.to_string() });
        }
        record.status = ConflictStatus::Resolved;
        record.resolved_value = Some(value);
        record.resolved_with = Some(resolved_with.to_string());
        record.resolved_at = Some(now);
        tracing::info!(conflict_id = %id, field = %record.field, resolved_with, "Conflict resolved");
        Ok(record.clone())
    }
}

// ---------------------------------------------------------------------------
// JobStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &SyncJob) -> Result<()>;

    async fn load(&self, id: Uuid) -> Result<Option<SyncJob>>;

    /// All jobs, most recently started first.
    async fn list(&self) -> Result<Vec<SyncJob>>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<Uuid, SyncJob>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &SyncJob) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<SyncJob>> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    async fn list(&self) -> Result<Vec<SyncJob>> {
        let mut jobs: Vec<SyncJob> = self.jobs.iter().map(|j| j.clone()).collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }
}

/// One JSON file per job under a directory.
///
/// Each save writes `<id>.json.tmp` and renames it over `<id>.json`, so a
/// crash mid-write leaves the previous cursor intact.
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save(&self, job: &SyncJob) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(job.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(job)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(job_id = %job.id, path = %path.display(), "Job saved");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<SyncJob>> {
        let path = self.path_for(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    async fn list(&self) -> Result<Vec<SyncJob>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<SyncJob>(&json) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable job file")
                }
            }
        }
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictStrategy, FieldConflict, Resolution};
    use crate::job::SyncJobSpec;
    use crate::mapper::{FieldMapping, MappingSet};
    use std::sync::Arc;

    fn held(job_id: Uuid, record_key: &str) -> ConflictRecord {
        ConflictRecord::new(
            job_id,
            ObjectType::Contact,
            record_key,
            "101",
            FieldConflict {
                field: "phone".into(),
                source_value: FieldValue::from("A"),
                target_value: FieldValue::from("B"),
            },
            ConflictStrategy::Manual,
            &Resolution::Unresolved,
            Utc::now(),
        )
    }

    fn job() -> SyncJob {
        SyncJob::new(
            SyncJobSpec::new(
                "salesforce",
                "hubspot",
                vec![ObjectType::Contact],
                MappingSet::new().with(ObjectType::Contact, FieldMapping::identity(["email"])),
            ),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let store = MemoryConflictStore::new();
        let c = store.insert(held(Uuid::new_v4(), "a@x.com")).await.unwrap();

        let first = store
            .resolve(c.id, FieldValue::from("A"), "source_wins", Utc::now())
            .await
            .unwrap();
        assert_eq!(first.status, ConflictStatus::Resolved);
        assert_eq!(first.resolved_value, Some(FieldValue::from("A")));

        let err = store
            .resolve(c.id, FieldValue::from("B"), "target_wins", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::ConflictAlreadyResolved { .. }));

        let stored = store.get(c.id).await.unwrap().unwrap();
        assert_eq!(stored.resolved_value, Some(FieldValue::from("A")));
        assert_eq!(stored.resolved_with.as_deref(), Some("source_wins"));
    }

    #[tokio::test]
    async fn concurrent_resolutions_have_one_winner() {
        let store = Arc::new(MemoryConflictStore::new());
        let c = store.insert(held(Uuid::new_v4(), "a@x.com")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .resolve(c.id, FieldValue::from(i), "manual", Utc::now())
                    .await
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn duplicate_insert_returns_existing() {
        let store = MemoryConflictStore::new();
        let job_id = Uuid::new_v4();
        let first = store.insert(held(job_id, "a@x.com")).await.unwrap();
        let again = store.insert(held(job_id, "a@x.com")).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(store.len(), 1);

        store.insert(held(job_id, "b@x.com")).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_limit() {
        let store = MemoryConflictStore::new();
        let job_id = Uuid::new_v4();
        let a = store.insert(held(job_id, "a")).await.unwrap();
        store.insert(held(job_id, "b")).await.unwrap();
        store.insert(held(job_id, "c")).await.unwrap();
        store
            .resolve(a.id, FieldValue::from("A"), "manual", Utc::now())
            .await
            .unwrap();

        let open = store.list(&ConflictQuery::unresolved(10)).await.unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|c| !c.is_resolved()));
        assert_eq!(store.list(&ConflictQuery::unresolved(1)).await.unwrap().len(), 1);
        assert_eq!(store.list(&ConflictQuery::default()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn resolving_unknown_conflict_is_not_found() {
        let store = MemoryConflictStore::new();
        let err = store
            .resolve(Uuid::new_v4(), FieldValue::Null, "manual", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), Some(404));
    }

    #[tokio::test]
    async fn file_store_save_load_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::new(dir.path().join("jobs"));
        assert!(store.list().await.unwrap().is_empty());

        let mut first = job();
        store.save(&first).await.unwrap();
        first.advance(ObjectType::Contact, 50, 50, Utc::now()).unwrap();
        store.save(&first).await.unwrap();

        let loaded = store.load(first.id).await.unwrap().unwrap();
        assert_eq!(loaded.cursor(ObjectType::Contact).offset, 50);
        assert!(!dir
            .path()
            .join("jobs")
            .join(format!("{}.json.tmp", first.id))
            .exists());

        store.save(&job()).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_job_store_overwrites() {
        let store = MemoryJobStore::new();
        let mut saved = job();
        store.save(&saved).await.unwrap();
        saved.complete(Utc::now()).unwrap();
        store.save(&saved).await.unwrap();
        let loaded = store.load(saved.id).await.unwrap().unwrap();
        assert!(loaded.is_terminal());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
