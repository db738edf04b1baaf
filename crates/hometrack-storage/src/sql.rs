//! SQLite backend. One row per item under a (property_id, sort_key) primary
//! key: `metadata` holds the current property, `history-<seq>` one event and
//! `conflict-<seq>` one conflict record. Sequences only grow; event order is
//! rebuilt from event timestamps on load.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hometrack_core::{
    ConflictId, ConflictKind, ConflictRecord, ConflictStatus, EventId, EventKey, EventPayload,
    HistoryEvent, HistoryEventType, HistoryLog, Property, PropertyId, ReportedValue,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite};
use tracing::debug;

use crate::{validate_batch, CommitBatch, PropertyRecord, PropertyStore, StoreError};

const METADATA_KEY: &str = "metadata";

const CREATE_ITEMS: &str = r#"
CREATE TABLE IF NOT EXISTS property_items (
    property_id TEXT NOT NULL,
    sort_key    TEXT NOT NULL,
    body        TEXT NOT NULL,
    PRIMARY KEY (property_id, sort_key)
)
"#;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataItem {
    version: u64,
    next_history_seq: u64,
    next_conflict_seq: u64,
    property: Property,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryItem {
    event_id: EventId,
    event_type: HistoryEventType,
    event_timestamp: DateTime<Utc>,
    ingestion_timestamp: DateTime<Utc>,
    source_id: String,
    payload: EventPayload,
}

impl From<&HistoryEvent> for HistoryItem {
    fn from(event: &HistoryEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type(),
            event_timestamp: event.event_at,
            ingestion_timestamp: event.ingested_at,
            source_id: event.source_id.clone(),
            payload: event.payload.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConflictItem {
    conflict_id: ConflictId,
    kind: ConflictKind,
    subject: Option<EventKey>,
    sources: Vec<String>,
    values: Vec<ReportedValue>,
    detected_at: DateTime<Utc>,
    status: ConflictStatus,
    resolves: Option<ConflictId>,
    note: Option<String>,
}

impl From<&ConflictRecord> for ConflictItem {
    fn from(conflict: &ConflictRecord) -> Self {
        Self {
            conflict_id: conflict.id,
            kind: conflict.kind,
            subject: conflict.subject,
            sources: conflict.sources.clone(),
            values: conflict.values.clone(),
            detected_at: conflict.detected_at,
            status: conflict.status,
            resolves: conflict.resolves,
            note: conflict.note.clone(),
        }
    }
}

impl ConflictItem {
    fn into_record(self, property_id: &PropertyId) -> ConflictRecord {
        ConflictRecord {
            id: self.conflict_id,
            property_id: property_id.clone(),
            kind: self.kind,
            subject: self.subject,
            sources: self.sources,
            values: self.values,
            detected_at: self.detected_at,
            status: self.status,
            resolves: self.resolves,
            note: self.note,
        }
    }
}

fn history_key(seq: u64) -> String {
    format!("history-{seq:010}")
}

fn conflict_key(seq: u64) -> String {
    format!("conflict-{seq:010}")
}

#[derive(Debug, Clone)]
pub struct SqlitePropertyStore {
    pool: SqlitePool,
}

struct Loaded {
    record: PropertyRecord,
    next_history_seq: u64,
    next_conflict_seq: u64,
}

impl SqlitePropertyStore {
    /// Connects and creates the item table if needed. In-memory databases are
    /// held on a single connection so every caller sees the same database.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_ITEMS).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load<'e, E>(executor: E, id: &PropertyId) -> Result<Option<Loaded>, StoreError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let rows = sqlx::query(
            "SELECT sort_key, body FROM property_items WHERE property_id = ? ORDER BY sort_key",
        )
        .bind(id.to_string())
        .fetch_all(executor)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut metadata: Option<MetadataItem> = None;
        let mut events = Vec::new();
        let mut conflicts = Vec::new();
        for row in rows {
            let sort_key: String = row.try_get("sort_key")?;
            let body: String = row.try_get("body")?;
            let corrupt = |detail: String| StoreError::Corrupt {
                property_id: id.to_string(),
                sort_key: sort_key.clone(),
                detail,
            };
            if sort_key == METADATA_KEY {
                metadata = Some(serde_json::from_str(&body).map_err(|e| corrupt(e.to_string()))?);
            } else if sort_key.starts_with("history-") {
                let item: HistoryItem =
                    serde_json::from_str(&body).map_err(|e| corrupt(e.to_string()))?;
                if item.payload.event_type() != item.event_type {
                    return Err(corrupt(format!(
                        "event type {} does not match payload {}",
                        item.event_type,
                        item.payload.event_type()
                    )));
                }
                events.push(HistoryEvent {
                    id: item.event_id,
                    event_at: item.event_timestamp,
                    ingested_at: item.ingestion_timestamp,
                    source_id: item.source_id,
                    payload: item.payload,
                });
            } else if sort_key.starts_with("conflict-") {
                let item: ConflictItem =
                    serde_json::from_str(&body).map_err(|e| corrupt(e.to_string()))?;
                conflicts.push(item.into_record(id));
            } else {
                return Err(corrupt("unknown sort key".into()));
            }
        }

        let metadata = metadata.ok_or_else(|| StoreError::Corrupt {
            property_id: id.to_string(),
            sort_key: METADATA_KEY.into(),
            detail: "items exist without a metadata row".into(),
        })?;
        Ok(Some(Loaded {
            record: PropertyRecord {
                property: metadata.property,
                history: HistoryLog::from_events(events),
                conflicts,
                version: metadata.version,
            },
            next_history_seq: metadata.next_history_seq,
            next_conflict_seq: metadata.next_conflict_seq,
        }))
    }

    async fn commit(&self, batch: CommitBatch) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let loaded = Self::load(&mut *tx, &batch.property_id).await?;
        validate_batch(loaded.as_ref().map(|l| &l.record), &batch)?;

        let id = batch.property_id.as_str();
        let mut next_history_seq = loaded.as_ref().map_or(0, |l| l.next_history_seq);
        let mut next_conflict_seq = loaded.as_ref().map_or(0, |l| l.next_conflict_seq);

        for event in &batch.new_events {
            let body = to_json(&batch.property_id, &HistoryItem::from(event))?;
            sqlx::query("INSERT INTO property_items (property_id, sort_key, body) VALUES (?, ?, ?)")
                .bind(id)
                .bind(history_key(next_history_seq))
                .bind(body)
                .execute(&mut *tx)
                .await?;
            next_history_seq += 1;
        }
        for conflict in &batch.new_conflicts {
            let body = to_json(&batch.property_id, &ConflictItem::from(conflict))?;
            sqlx::query("INSERT INTO property_items (property_id, sort_key, body) VALUES (?, ?, ?)")
                .bind(id)
                .bind(conflict_key(next_conflict_seq))
                .bind(body)
                .execute(&mut *tx)
                .await?;
            next_conflict_seq += 1;
        }

        let version = batch.expected_version + 1;
        let metadata = to_json(
            &batch.property_id,
            &MetadataItem {
                version,
                next_history_seq,
                next_conflict_seq,
                property: batch.property.clone(),
            },
        )?;
        let updated = if loaded.is_some() {
            sqlx::query(
                "UPDATE property_items SET body = ? \
                 WHERE property_id = ? AND sort_key = ? AND json_extract(body, '$.version') = ?",
            )
            .bind(metadata)
            .bind(id)
            .bind(METADATA_KEY)
            .bind(batch.expected_version as i64)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query("INSERT INTO property_items (property_id, sort_key, body) VALUES (?, ?, ?)")
                .bind(id)
                .bind(METADATA_KEY)
                .bind(metadata)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        };
        if updated != 1 {
            return Err(StoreError::CommitConflict {
                property_id: batch.property_id.clone(),
                expected: batch.expected_version,
                actual: None,
            });
        }

        tx.commit().await?;
        debug!(property_id = %batch.property_id, version, "committed property batch");
        Ok(version)
    }
}

fn to_json<T: Serialize>(id: &PropertyId, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        property_id: id.to_string(),
        sort_key: String::new(),
        detail: e.to_string(),
    })
}

/// Lock contention and duplicate keys both mean another writer got there first.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return true;
            }
            db.code()
                .and_then(|code| code.parse::<i64>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6))
        }
        _ => false,
    }
}

#[async_trait]
impl PropertyStore for SqlitePropertyStore {
    async fn get(&self, id: &PropertyId) -> Result<Option<Arc<PropertyRecord>>, StoreError> {
        Ok(Self::load(&self.pool, id).await?.map(|l| Arc::new(l.record)))
    }

    async fn append_history(&self, batch: CommitBatch) -> Result<u64, StoreError> {
        let property_id = batch.property_id.clone();
        let expected = batch.expected_version;
        match self.commit(batch).await {
            Err(StoreError::Backend(err)) if is_contention(&err) => Err(StoreError::CommitConflict {
                property_id,
                expected,
                actual: None,
            }),
            other => other,
        }
    }

    async fn property_ids(&self) -> Result<Vec<PropertyId>, StoreError> {
        let rows = sqlx::query(
            "SELECT property_id FROM property_items WHERE sort_key = ? ORDER BY property_id",
        )
        .bind(METADATA_KEY)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get("property_id")?;
                PropertyId::parse(&raw).ok_or_else(|| StoreError::Corrupt {
                    property_id: raw.clone(),
                    sort_key: METADATA_KEY.into(),
                    detail: "not a property identifier".into(),
                })
            })
            .collect()
    }
}
