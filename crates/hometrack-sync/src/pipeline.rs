//! Ingestion driver: intake, identity, merge, commit and reindex for every
//! queued record, spread over a pool of workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hometrack_adapters::{adapter_for_source, normalize_value, IngestMessage, MalformedLine};
use hometrack_core::{resolve, PropertyId, ResolvedAddress, SourceSnapshot};
use hometrack_storage::{
    BackoffPolicy, DeadLetter, DeadLetterSink, FailureStage, KeyedLocks, PropertyRecord,
    PropertyStore, StoreError,
};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SourceRegistry, SyncConfig};
use crate::index::QueryIndex;
use crate::merge::{merge, MergeError};
use crate::report::RunStats;

/// What happened to one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Committed {
        property_id: PropertyId,
        version: u64,
        new_events: usize,
        new_conflicts: usize,
    },
    Unchanged {
        property_id: PropertyId,
    },
    DeadLettered {
        stage: FailureStage,
        error_kind: String,
        /// False when the sink failed and the record was lost.
        persisted: bool,
    },
    /// Shutdown was requested before the record was committed.
    Aborted,
}

#[derive(Debug)]
enum StepError {
    Store(StoreError),
    Merge(MergeError),
    Aborted,
}

impl StepError {
    fn is_commit_conflict(&self) -> bool {
        matches!(self, StepError::Store(err) if err.is_commit_conflict())
    }
}

#[derive(Debug)]
struct Failure {
    stage: FailureStage,
    error_kind: String,
    reason: String,
    attempts: usize,
}

impl Failure {
    fn new(stage: FailureStage, error_kind: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            stage,
            error_kind: error_kind.into(),
            reason: reason.to_string(),
            attempts: 1,
        }
    }
}

/// Where a record came from.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub run_id: Uuid,
    pub message_id: Option<String>,
    pub source_id: String,
    pub crawled_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn PropertyStore>,
    index: Arc<QueryIndex>,
    dead_letters: Arc<dyn DeadLetterSink>,
    registry: Arc<SourceRegistry>,
    locks: Arc<KeyedLocks>,
    backoff: BackoffPolicy,
    workers: usize,
    queue_depth: usize,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn PropertyStore>,
        index: Arc<QueryIndex>,
        dead_letters: Arc<dyn DeadLetterSink>,
        registry: SourceRegistry,
    ) -> Self {
        Self {
            store,
            index,
            dead_letters,
            registry: Arc::new(registry),
            locks: Arc::new(KeyedLocks::new()),
            backoff: BackoffPolicy::default(),
            workers: 4,
            queue_depth: 64,
        }
    }

    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.backoff = BackoffPolicy::with_retries(config.commit_retries);
        self.workers = config.workers.max(1);
        self.queue_depth = config.queue_depth.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<QueryIndex> {
        &self.index
    }

    /// Feeds `messages` through the worker pool and waits for it to drain.
    pub async fn ingest_batch(&self, run_id: Uuid, messages: Vec<IngestMessage>) -> RunStats {
        let (_shutdown_tx, shutdown) = watch::channel(false);
        self.ingest_until(run_id, messages, shutdown).await
    }

    /// Like [`IngestPipeline::ingest_batch`] but stops early once `shutdown` turns true.
    pub async fn ingest_until(
        &self,
        run_id: Uuid,
        messages: Vec<IngestMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> RunStats {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let producer = tokio::spawn(async move {
            for message in messages {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        let stats = self.run(run_id, rx, shutdown).await;
        if let Err(err) = producer.await {
            error!(error = %err, "message producer task failed");
        }
        stats
    }

    /// Drains `queue` with the configured number of workers until it closes
    /// or shutdown is signalled.
    pub async fn run(
        &self,
        run_id: Uuid,
        queue: mpsc::Receiver<IngestMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> RunStats {
        let queue = Arc::new(Mutex::new(queue));
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let pipeline = self.clone();
            let queue = Arc::clone(&queue);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let mut stats = RunStats::default();
                while let Some(message) = next_message(&queue, &mut shutdown).await {
                    debug!(worker, source_id = %message.source_id, "worker picked up message");
                    pipeline
                        .process_message(run_id, message, &shutdown, &mut stats)
                        .await;
                }
                stats
            }));
        }

        let mut total = RunStats::default();
        for handle in handles {
            match handle.await {
                Ok(stats) => total.absorb(stats),
                Err(err) => error!(error = %err, "ingest worker panicked"),
            }
        }
        info!(
            %run_id,
            records = total.records,
            committed = total.committed,
            dead_lettered = total.dead_lettered,
            "ingest run finished"
        );
        total
    }

    pub async fn process_message(
        &self,
        run_id: Uuid,
        message: IngestMessage,
        shutdown: &watch::Receiver<bool>,
        stats: &mut RunStats,
    ) {
        stats.messages += 1;
        let ctx = RecordContext {
            run_id,
            message_id: message.message_id,
            source_id: message.source_id,
            crawled_at: message.crawled_at,
        };
        for record in &message.records {
            let outcome = self.process_record(&ctx, record, shutdown).await;
            tally(stats, &ctx.source_id, outcome);
        }
    }

    /// Routes queue lines that never decoded into messages to the dead
    /// letters at the intake stage, raw text and decode error included.
    pub async fn reject_malformed(&self, run_id: Uuid, origin: &str, lines: Vec<MalformedLine>) -> RunStats {
        let mut stats = RunStats::default();
        for line in lines {
            stats.malformed_lines += 1;
            let ctx = RecordContext {
                run_id,
                message_id: Some(format!("{origin}:{}", line.line)),
                source_id: line.source_hint().unwrap_or_else(|| "unknown".to_string()),
                crawled_at: None,
            };
            let failure = Failure::new(FailureStage::Intake, "malformed-message", &line);
            let payload = JsonValue::String(line.raw);
            let outcome = self.dead_letter(&ctx, &payload, failure).await;
            tally(&mut stats, &ctx.source_id, outcome);
        }
        stats
    }

    /// Runs one raw record through every stage. Failures go to the dead-letter
    /// sink; nothing here returns an error to the caller.
    pub async fn process_record(
        &self,
        ctx: &RecordContext,
        record: &JsonValue,
        shutdown: &watch::Receiver<bool>,
    ) -> RecordOutcome {
        let span = info_span!(
            "ingest_record",
            run_id = %ctx.run_id,
            source_id = %ctx.source_id,
            property_id = tracing::field::Empty,
        );
        async {
            if *shutdown.borrow() {
                return RecordOutcome::Aborted;
            }
            match self.try_process(ctx, record, shutdown).await {
                Ok(outcome) => outcome,
                Err(failure) => self.dead_letter(ctx, record, failure).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn try_process(
        &self,
        ctx: &RecordContext,
        record: &JsonValue,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<RecordOutcome, Failure> {
        self.registry
            .admit(&ctx.source_id)
            .map_err(|err| Failure::new(FailureStage::Intake, err.kind(), &err))?;
        let adapter = adapter_for_source(&ctx.source_id);
        let snapshot = normalize_value(adapter.as_ref(), record, ctx.crawled_at)
            .map_err(|err| Failure::new(FailureStage::Intake, err.kind(), &err))?;
        let resolved = resolve(&snapshot.address)
            .map_err(|err| Failure::new(FailureStage::Identity, "identity", &err))?;
        tracing::Span::current().record("property_id", tracing::field::display(&resolved.id));

        let _guard = self.locks.lock(resolved.id.as_str()).await;
        let (snapshot, resolved, this) = (&snapshot, &resolved, self);
        let (result, attempts) = self
            .backoff
            .run(StepError::is_commit_conflict, move || {
                this.merge_and_commit(snapshot, resolved, shutdown)
            })
            .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(StepError::Aborted) => {
                warn!("shutdown requested; record left uncommitted");
                Ok(RecordOutcome::Aborted)
            }
            Err(StepError::Merge(err)) => Err(Failure::new(FailureStage::Merge, err.kind(), &err)),
            Err(StepError::Store(err)) => {
                let kind = if err.is_commit_conflict() { "commit-conflict" } else { "store" };
                let mut failure = Failure::new(FailureStage::Commit, kind, &err);
                failure.attempts = attempts;
                Err(failure)
            }
        }
    }

    /// One read-merge-commit attempt. Must run under the property's lock.
    async fn merge_and_commit(
        &self,
        snapshot: &SourceSnapshot,
        resolved: &ResolvedAddress,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<RecordOutcome, StepError> {
        let existing = self.store.get(&resolved.id).await.map_err(StepError::Store)?;
        let ingested_at = Utc::now();
        let outcome = merge(existing.as_deref(), snapshot, resolved, ingested_at).map_err(StepError::Merge)?;
        if outcome.is_noop() {
            debug!(property_id = %resolved.id, "snapshot already reflected in history");
            return Ok(RecordOutcome::Unchanged {
                property_id: resolved.id.clone(),
            });
        }
        if *shutdown.borrow() {
            return Err(StepError::Aborted);
        }

        let expected = existing.as_ref().map_or(0, |r| r.version);
        let new_events = outcome.new_events.len();
        let new_conflicts = outcome.new_conflicts.clone();
        let mut conflicts = existing.as_ref().map(|r| r.conflicts.clone()).unwrap_or_default();
        conflicts.extend(new_conflicts.iter().cloned());
        let property = outcome.property.clone();
        let history = outcome.history.clone();

        let version = self
            .store
            .append_history(outcome.into_batch(expected))
            .await
            .map_err(StepError::Store)?;
        for conflict in &new_conflicts {
            warn!(
                property_id = %resolved.id,
                conflict_id = %conflict.id,
                kind = %conflict.kind,
                status = %conflict.status,
                sources = ?conflict.sources,
                "conflict recorded"
            );
        }

        self.index
            .upsert(&PropertyRecord {
                property,
                history,
                conflicts,
                version,
            })
            .await;
        Ok(RecordOutcome::Committed {
            property_id: resolved.id.clone(),
            version,
            new_events,
            new_conflicts: new_conflicts.len(),
        })
    }

    async fn dead_letter(&self, ctx: &RecordContext, record: &JsonValue, failure: Failure) -> RecordOutcome {
        warn!(
            stage = %failure.stage,
            error_kind = %failure.error_kind,
            reason = %failure.reason,
            attempts = failure.attempts,
            "record routed to dead letters"
        );
        let letter = DeadLetter::new(
            ctx.source_id.clone(),
            failure.stage,
            failure.error_kind.clone(),
            failure.reason,
            record.clone(),
        )
        .with_message_id(ctx.message_id.clone())
        .with_attempts(failure.attempts);
        let persisted = match self.dead_letters.route(letter).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, stage = %failure.stage, "failed to persist dead letter; record lost");
                false
            }
        };
        RecordOutcome::DeadLettered {
            stage: failure.stage,
            error_kind: failure.error_kind,
            persisted,
        }
    }
}

fn tally(stats: &mut RunStats, source_id: &str, outcome: RecordOutcome) {
    stats.records += 1;
    let source = stats.source_mut(source_id);
    source.records += 1;
    match &outcome {
        RecordOutcome::Committed { .. } => source.committed += 1,
        RecordOutcome::Unchanged { .. } => source.unchanged += 1,
        RecordOutcome::DeadLettered { persisted: true, .. } => source.dead_lettered += 1,
        RecordOutcome::DeadLettered { persisted: false, .. } => source.dead_letter_failures += 1,
        RecordOutcome::Aborted => {}
    }
    match outcome {
        RecordOutcome::Committed {
            new_events,
            new_conflicts,
            ..
        } => {
            stats.committed += 1;
            stats.new_events += new_events;
            stats.new_conflicts += new_conflicts;
        }
        RecordOutcome::Unchanged { .. } => stats.unchanged += 1,
        RecordOutcome::DeadLettered { persisted: false, .. } => stats.dead_letter_failures += 1,
        RecordOutcome::DeadLettered { stage, .. } => {
            stats.dead_lettered += 1;
            *stats
                .dead_letters_by_stage
                .entry(stage.to_string())
                .or_default() += 1;
        }
        RecordOutcome::Aborted => stats.aborted += 1,
    }
}

/// Next queued message, or `None` once the queue is closed or shutdown is signalled.
async fn next_message(
    queue: &Mutex<mpsc::Receiver<IngestMessage>>,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<IngestMessage> {
    let mut queue = queue.lock().await;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            message = queue.recv() => return message,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    // Nobody can signal shutdown any more; drain normally.
                    return queue.recv().await;
                }
            }
        }
    }
}

/// A shutdown flag that flips when the process receives Ctrl-C.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing in-flight records");
            let _ = tx.send(true);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use hometrack_adapters::parse_messages;
    use hometrack_storage::{InMemoryPropertyStore, MemoryDeadLetters};

    fn registry() -> SourceRegistry {
        SourceRegistry::parse(
            "sources:\n  - source_id: redfin\n    display_name: Redfin\n    enabled: true\n  - source_id: zillow\n    display_name: Zillow\n    enabled: true\n",
        )
        .unwrap()
    }

    fn pipeline(dead: Arc<MemoryDeadLetters>) -> IngestPipeline {
        IngestPipeline::new(
            Arc::new(InMemoryPropertyStore::new()),
            Arc::new(QueryIndex::new()),
            dead,
            registry(),
        )
        .with_workers(2)
    }

    const MESSAGES: &str = r#"
{"message_id":"m1","source_id":"redfin","crawled_at":"2024-01-25T06:00:00Z","records":[{"address":"123 Main St, Apt 4B, Seattle, WA 98101","status":"Active","price":500000,"history":[{"date":"2024-01-01","description":"Listed","price":500000}]},{"address":"PO Box 12, Seattle, WA 98101","status":"Active"}]}
{"message_id":"m2","source_id":"trulia","crawled_at":"2024-01-25T06:00:00Z","records":[{"address":"9 Pine St, Seattle, WA 98101","status":"Active"}]}
{"message_id":"m3","source_id":"redfin","crawled_at":"2024-01-25T06:00:00Z","records":[{"status":"Active"}]}
"#;

    #[tokio::test]
    async fn failures_are_isolated_to_dead_letters() {
        let dead = Arc::new(MemoryDeadLetters::new());
        let pipeline = pipeline(Arc::clone(&dead));
        let stats = pipeline
            .ingest_batch(Uuid::new_v4(), parse_messages(MESSAGES).messages)
            .await;

        assert_eq!(stats.messages, 3);
        assert_eq!(stats.records, 4);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.dead_lettered, 3);
        assert_eq!(stats.dead_letters_by_stage["identity"], 1);
        assert_eq!(stats.dead_letters_by_stage["intake"], 2);

        let letters = dead.letters().await;
        assert_eq!(letters.len(), 3);
        let identity = letters
            .iter()
            .find(|l| l.stage == FailureStage::Identity)
            .unwrap();
        assert_eq!(identity.message_id.as_deref(), Some("m1"));
        assert_eq!(identity.payload["address"], "PO Box 12, Seattle, WA 98101");
        assert_eq!(pipeline.index().len().await, 1);
    }

    #[tokio::test]
    async fn replaying_a_batch_changes_nothing() {
        let dead = Arc::new(MemoryDeadLetters::new());
        let pipeline = pipeline(dead);
        let messages = parse_messages(MESSAGES).messages;
        pipeline.ingest_batch(Uuid::new_v4(), messages.clone()).await;
        let ids = pipeline.store().property_ids().await.unwrap();
        let before = pipeline.store().get(&ids[0]).await.unwrap().unwrap();

        let stats = pipeline.ingest_batch(Uuid::new_v4(), messages).await;
        assert_eq!(stats.committed, 0);
        assert_eq!(stats.unchanged, 1);
        let after = pipeline.store().get(&ids[0]).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn shutdown_leaves_records_uncommitted() {
        let dead = Arc::new(MemoryDeadLetters::new());
        let pipeline = pipeline(Arc::clone(&dead));
        let (tx, rx) = watch::channel(true);
        let stats = pipeline
            .ingest_until(Uuid::new_v4(), parse_messages(MESSAGES).messages, rx)
            .await;
        drop(tx);
        assert_eq!(stats.committed, 0);
        assert!(pipeline.store().property_ids().await.unwrap().is_empty());
        assert!(dead.letters().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_lines_are_dead_lettered_and_the_rest_ingested() {
        let dead = Arc::new(MemoryDeadLetters::new());
        let pipeline = pipeline(Arc::clone(&dead));
        let text = format!("{MESSAGES}{{\"source_id\":\"redfin\",\"records\":[\nnot json\n");
        let batch = parse_messages(&text);
        assert_eq!(batch.malformed.len(), 2);

        let run_id = Uuid::new_v4();
        let mut stats = pipeline
            .reject_malformed(run_id, "queue.jsonl", batch.malformed)
            .await;
        stats.absorb(pipeline.ingest_batch(run_id, batch.messages).await);

        assert_eq!(stats.malformed_lines, 2);
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.dead_lettered, 5);
        assert_eq!(stats.dead_letters_by_stage["intake"], 4);

        let letters = dead.letters().await;
        let rejected: Vec<_> = letters
            .iter()
            .filter(|l| l.error_kind == "malformed-message")
            .collect();
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|l| l.stage == FailureStage::Intake));
        assert!(rejected
            .iter()
            .any(|l| l.payload == JsonValue::String("not json".into())
                && l.message_id.as_deref() == Some("queue.jsonl:6")));
    }

    #[tokio::test]
    async fn lost_dead_letters_are_counted_separately() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, b"").unwrap();
        let sink = Arc::new(hometrack_storage::DeadLetterArchive::new(blocker.join("letters")));
        let pipeline = IngestPipeline::new(
            Arc::new(InMemoryPropertyStore::new()),
            Arc::new(QueryIndex::new()),
            sink,
            registry(),
        );

        let stats = pipeline
            .ingest_batch(Uuid::new_v4(), parse_messages(MESSAGES).messages)
            .await;
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(stats.dead_letter_failures, 3);
        assert!(stats.dead_letters_by_stage.is_empty());
        assert_eq!(stats.per_source["redfin"].dead_letter_failures, 2);
    }
}
