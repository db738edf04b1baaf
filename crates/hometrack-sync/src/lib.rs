//! Reconciliation and ingestion: the history merger, cross-source conflict
//! detection, the query index and the worker pipeline that ties them to the
//! store.

pub mod audit;
pub mod config;
pub mod conflicts;
pub mod index;
pub mod merge;
pub mod pipeline;
pub mod report;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use hometrack_adapters::load_messages;
use hometrack_storage::{open_store, DeadLetterArchive};
use tracing::info;
use uuid::Uuid;

pub use audit::{AuditConfig, DuplicateAudit, NearDuplicate};
pub use config::{SourceConfig, SourceRegistry, SyncConfig};
pub use index::{IndexEntry, QueryIndex, SearchPage};
pub use merge::{merge, MergeError, MergeOutcome};
pub use pipeline::{IngestPipeline, RecordContext, RecordOutcome};
pub use report::{write_run_report, IngestSummary, RunStats, SourceCounts};

pub const CRATE_NAME: &str = "hometrack-sync";

/// Opens the store named by the config and a query index rebuilt from it.
pub async fn open_index(config: &SyncConfig) -> Result<(Arc<dyn hometrack_storage::PropertyStore>, Arc<QueryIndex>)> {
    let store = open_store(&config.database_url)
        .await
        .with_context(|| format!("opening store {}", config.database_url))?;
    let index = Arc::new(QueryIndex::new());
    index
        .rebuild(store.as_ref())
        .await
        .context("rebuilding query index")?;
    Ok((store, index))
}

/// One batch run over JSON-lines message files: ingest, audit for
/// near-duplicate addresses and write the run report.
pub async fn run_ingest(config: &SyncConfig, inputs: &[PathBuf]) -> Result<IngestSummary> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let registry = config.load_sources()?;

    let mut messages = Vec::new();
    let mut malformed = Vec::new();
    for input in inputs {
        let batch = load_messages(input)?;
        messages.extend(batch.messages);
        if !batch.malformed.is_empty() {
            malformed.push((input.display().to_string(), batch.malformed));
        }
    }
    info!(%run_id, files = inputs.len(), messages = messages.len(), "starting ingest run");

    let (store, index) = open_index(config).await?;
    let dead_letters = Arc::new(DeadLetterArchive::new(config.dead_letter_dir.clone()));
    let pipeline = IngestPipeline::new(store, Arc::clone(&index), dead_letters, registry).with_config(config);
    let mut stats = RunStats::default();
    for (origin, lines) in malformed {
        stats.absorb(pipeline.reject_malformed(run_id, &origin, lines).await);
    }
    stats.absorb(
        pipeline
            .ingest_until(run_id, messages, pipeline::shutdown_on_ctrl_c())
            .await,
    );

    let near_duplicates = DuplicateAudit::new(AuditConfig::default()).apply(&index.properties().await);
    let summary = IngestSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        database_url: config.database_url.clone(),
        inputs: inputs.iter().map(|p| p.display().to_string()).collect(),
        stats,
        indexed_properties: index.len().await,
        near_duplicates,
    };
    let run_dir = write_run_report(&config.reports_dir, &summary).await?;
    info!(%run_id, report = %run_dir.display(), "ingest run report written");
    Ok(summary)
}
