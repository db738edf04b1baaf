//! Consistency store for properties, their ordered history and conflict
//! records, plus the dead-letter archive and the lock/retry helpers that
//! surround commits.

pub mod dead_letter;
pub mod locks;
pub mod memory;
pub mod retry;
pub mod sql;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hometrack_core::history::event_order;
use hometrack_core::{
    effective_conflicts, ConflictId, ConflictRecord, ConflictStatus, HistoryEvent, HistoryLog,
    Property, PropertyId,
};
use thiserror::Error;

pub use dead_letter::{
    ArchivedLetter, DeadLetter, DeadLetterArchive, DeadLetterSink, FailureStage, MemoryDeadLetters,
};
pub use locks::KeyedLocks;
pub use memory::InMemoryPropertyStore;
pub use retry::BackoffPolicy;
pub use sql::SqlitePropertyStore;

pub const CRATE_NAME: &str = "hometrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("concurrent commit on {property_id}: expected version {expected}, found {actual:?}")]
    CommitConflict {
        property_id: PropertyId,
        expected: u64,
        actual: Option<u64>,
    },
    #[error("property {0} not found")]
    NotFound(PropertyId),
    #[error("conflict {conflict_id} not found on property {property_id}")]
    ConflictNotFound {
        property_id: PropertyId,
        conflict_id: ConflictId,
    },
    #[error("write to {property_id} rejected: {reason}")]
    Rejected { property_id: PropertyId, reason: String },
    #[error("stored item {property_id}/{sort_key} is corrupt: {detail}")]
    Corrupt {
        property_id: String,
        sort_key: String,
        detail: String,
    },
    #[error("storage backend: {0}")]
    Backend(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_commit_conflict(&self) -> bool {
        matches!(self, StoreError::CommitConflict { .. })
    }
}

/// Everything stored under one property identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRecord {
    pub property: Property,
    pub history: HistoryLog,
    /// Originals and resolution records, in insertion order.
    pub conflicts: Vec<ConflictRecord>,
    /// Number of commits applied so far.
    pub version: u64,
}

impl PropertyRecord {
    /// Original conflicts with their effective status, optionally filtered by it.
    pub fn conflicts_with_status(
        &self,
        status: Option<ConflictStatus>,
    ) -> Vec<(ConflictRecord, ConflictStatus)> {
        effective_conflicts(&self.conflicts)
            .into_iter()
            .filter(|(_, s)| status.map_or(true, |wanted| *s == wanted))
            .collect()
    }

    pub fn has_conflict(&self, id: ConflictId) -> bool {
        self.conflicts.iter().any(|c| c.id == id)
    }
}

/// One all-or-nothing write: new history events, new conflict records and the
/// replacement property snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitBatch {
    pub property_id: PropertyId,
    /// Version the batch was computed against; 0 for a property not yet stored.
    pub expected_version: u64,
    pub property: Property,
    pub new_events: Vec<HistoryEvent>,
    pub new_conflicts: Vec<ConflictRecord>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.new_events.is_empty() && self.new_conflicts.is_empty()
    }
}

/// Checks a batch against the stored record before anything is written.
pub fn validate_batch(current: Option<&PropertyRecord>, batch: &CommitBatch) -> Result<(), StoreError> {
    let reject = |reason: String| StoreError::Rejected {
        property_id: batch.property_id.clone(),
        reason,
    };
    let actual = current.map(|r| r.version).unwrap_or(0);
    if actual != batch.expected_version {
        return Err(StoreError::CommitConflict {
            property_id: batch.property_id.clone(),
            expected: batch.expected_version,
            actual: Some(actual),
        });
    }
    if batch.property.id != batch.property_id {
        return Err(reject(format!("snapshot belongs to {}", batch.property.id)));
    }
    if current.is_none() && batch.new_events.is_empty() {
        return Err(reject("a new property needs at least one history event".into()));
    }
    for event in &batch.new_events {
        if current.is_some_and(|r| r.history.contains(event.id)) {
            return Err(reject(format!("event {} is already recorded", event.id)));
        }
    }
    for conflict in &batch.new_conflicts {
        if current.is_some_and(|r| r.has_conflict(conflict.id)) {
            return Err(reject(format!("conflict {} is already recorded", conflict.id)));
        }
        if conflict.property_id != batch.property_id {
            return Err(reject(format!("conflict {} names another property", conflict.id)));
        }
    }
    Ok(())
}

/// The record that results from applying a validated batch.
pub fn apply_batch(current: Option<&PropertyRecord>, batch: CommitBatch) -> PropertyRecord {
    let (mut history, mut conflicts, version) = match current {
        Some(record) => (record.history.clone(), record.conflicts.clone(), record.version),
        None => (HistoryLog::new(), Vec::new(), 0),
    };
    let mut events = batch.new_events;
    events.sort_by(event_order);
    for event in events {
        history.insert(event);
    }
    conflicts.extend(batch.new_conflicts);
    PropertyRecord {
        property: batch.property,
        history,
        conflicts,
        version: version + 1,
    }
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get(&self, id: &PropertyId) -> Result<Option<Arc<PropertyRecord>>, StoreError>;

    /// Atomically appends events and conflicts and replaces the property
    /// snapshot. Returns the new version.
    async fn append_history(&self, batch: CommitBatch) -> Result<u64, StoreError>;

    /// Identifiers of every stored property, sorted.
    async fn property_ids(&self) -> Result<Vec<PropertyId>, StoreError>;

    async fn list_conflicts(
        &self,
        id: &PropertyId,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<(ConflictRecord, ConflictStatus)>, StoreError> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(record.conflicts_with_status(status))
    }

    /// Appends a manual resolution record for an original conflict.
    async fn resolve_conflict(
        &self,
        id: &PropertyId,
        conflict_id: ConflictId,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ConflictRecord, StoreError> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let original = record
            .conflicts
            .iter()
            .find(|c| c.id == conflict_id && !c.is_resolution())
            .ok_or_else(|| StoreError::ConflictNotFound {
                property_id: id.clone(),
                conflict_id,
            })?;
        let resolution = original.resolution(ConflictStatus::ManuallyResolved, note, at);
        self.append_history(CommitBatch {
            property_id: id.clone(),
            expected_version: record.version,
            property: record.property.clone(),
            new_events: Vec::new(),
            new_conflicts: vec![resolution.clone()],
        })
        .await?;
        Ok(resolution)
    }
}

/// Opens the store named by a `DATABASE_URL` style string: `memory` for the
/// in-process store, anything else is handed to SQLite.
pub async fn open_store(url: &str) -> Result<Arc<dyn PropertyStore>, StoreError> {
    if url.trim().eq_ignore_ascii_case("memory") {
        return Ok(Arc::new(InMemoryPropertyStore::new()));
    }
    Ok(Arc::new(SqlitePropertyStore::connect(url).await?))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::TimeZone;
    use hometrack_core::{resolve, ConflictKind, EventPayload, RawAddress};

    pub fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().unwrap()
    }

    pub fn property() -> Property {
        let resolved = resolve(&RawAddress::line("123 Main St, Apt 4B, Seattle, WA 98101")).unwrap();
        let log = HistoryLog::from_events(vec![listed(1)]);
        log.project(&resolved.id, &resolved.address).unwrap()
    }

    pub fn listed(day: u32) -> HistoryEvent {
        let id = property_id();
        HistoryEvent::new(&id, "redfin", at(day), at(day), EventPayload::Listed { price: Some(500_000.0) })
    }

    pub fn property_id() -> PropertyId {
        resolve(&RawAddress::line("123 Main St, Apt 4B, Seattle, WA 98101"))
            .unwrap()
            .id
    }

    pub fn conflict(day: u32) -> ConflictRecord {
        ConflictRecord::open(
            &property_id(),
            ConflictKind::MissingHistory,
            Some(listed(day).key()),
            vec!["zillow".into()],
            vec![],
            at(day),
        )
    }

    pub fn first_batch() -> CommitBatch {
        CommitBatch {
            property_id: property_id(),
            expected_version: 0,
            property: property(),
            new_events: vec![listed(1)],
            new_conflicts: vec![],
        }
    }

    /// Behaviour every backend must share.
    pub async fn exercise_store(store: &dyn PropertyStore) {
        let id = property_id();
        assert!(store.get(&id).await.unwrap().is_none());

        let empty = CommitBatch {
            new_events: vec![],
            ..first_batch()
        };
        assert!(matches!(
            store.append_history(empty).await,
            Err(StoreError::Rejected { .. })
        ));

        assert_eq!(store.append_history(first_batch()).await.unwrap(), 1);

        // A stale writer loses.
        let stale = store.append_history(first_batch()).await.unwrap_err();
        assert!(stale.is_commit_conflict());

        // Earlier event arriving late lands before the existing one.
        let late = CommitBatch {
            expected_version: 1,
            new_events: vec![HistoryEvent::new(
                &id,
                "zillow",
                at(1),
                at(3),
                EventPayload::Pending,
            )],
            new_conflicts: vec![conflict(2)],
            ..first_batch()
        };
        let mut backfill = late.clone();
        backfill.new_events.push(HistoryEvent::new(
            &id,
            "zillow",
            at(1) - chrono::Duration::days(10),
            at(3),
            EventPayload::Listed { price: Some(499_000.0) },
        ));
        assert_eq!(store.append_history(backfill).await.unwrap(), 2);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.history.len(), 3);
        let times: Vec<_> = record.history.events().iter().map(|e| e.event_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);

        // Re-sending a recorded event is refused rather than duplicated.
        let replay = CommitBatch {
            expected_version: 2,
            ..late
        };
        assert!(matches!(
            store.append_history(replay).await,
            Err(StoreError::Rejected { .. })
        ));

        let open = store.list_conflicts(&id, Some(ConflictStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        let resolution = store
            .resolve_conflict(&id, open[0].0.id, Some("checked county records".into()), at(5))
            .await
            .unwrap();
        assert_eq!(resolution.resolves, Some(open[0].0.id));
        assert!(store.list_conflicts(&id, Some(ConflictStatus::Open)).await.unwrap().is_empty());
        let all = store.list_conflicts(&id, None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, ConflictStatus::ManuallyResolved);

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.conflicts.len(), 2);
        assert_eq!(record.history.len(), 3);

        assert_eq!(store.property_ids().await.unwrap(), vec![id.clone()]);

        let missing = PropertyId::from_canonical("nowhere");
        assert!(matches!(
            store.list_conflicts(&missing, None).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store
                .resolve_conflict(&id, ConflictId(uuid::Uuid::nil()), None, at(6))
                .await,
            Err(StoreError::ConflictNotFound { .. })
        ));
    }
}
