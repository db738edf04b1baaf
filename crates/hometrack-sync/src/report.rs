use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::audit::NearDuplicate;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub records: usize,
    pub committed: usize,
    pub unchanged: usize,
    pub dead_lettered: usize,
    pub dead_letter_failures: usize,
}

/// Counters for one ingestion run; workers keep their own and they are summed at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub messages: usize,
    pub records: usize,
    pub committed: usize,
    pub unchanged: usize,
    pub aborted: usize,
    pub dead_lettered: usize,
    /// Failures the dead-letter sink could not persist; those records are lost.
    pub dead_letter_failures: usize,
    /// Queue lines that never decoded into a message.
    pub malformed_lines: usize,
    pub new_events: usize,
    pub new_conflicts: usize,
    pub dead_letters_by_stage: BTreeMap<String, usize>,
    pub per_source: BTreeMap<String, SourceCounts>,
}

impl RunStats {
    pub fn absorb(&mut self, other: RunStats) {
        self.messages += other.messages;
        self.records += other.records;
        self.committed += other.committed;
        self.unchanged += other.unchanged;
        self.aborted += other.aborted;
        self.dead_lettered += other.dead_lettered;
        self.dead_letter_failures += other.dead_letter_failures;
        self.malformed_lines += other.malformed_lines;
        self.new_events += other.new_events;
        self.new_conflicts += other.new_conflicts;
        for (stage, count) in other.dead_letters_by_stage {
            *self.dead_letters_by_stage.entry(stage).or_default() += count;
        }
        for (source, counts) in other.per_source {
            let entry = self.per_source.entry(source).or_default();
            entry.records += counts.records;
            entry.committed += counts.committed;
            entry.unchanged += counts.unchanged;
            entry.dead_lettered += counts.dead_lettered;
            entry.dead_letter_failures += counts.dead_letter_failures;
        }
    }

    pub fn source_mut(&mut self, source_id: &str) -> &mut SourceCounts {
        self.per_source.entry(source_id.to_string()).or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub database_url: String,
    pub inputs: Vec<String>,
    pub stats: RunStats,
    pub indexed_properties: usize,
    pub near_duplicates: Vec<NearDuplicate>,
}

impl IngestSummary {
    pub fn brief_markdown(&self) -> String {
        let stages = if self.stats.dead_letters_by_stage.is_empty() {
            "- none".to_string()
        } else {
            self.stats
                .dead_letters_by_stage
                .iter()
                .map(|(stage, count)| format!("- {stage}: {count}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let sources = self
            .stats
            .per_source
            .iter()
            .map(|(source, c)| {
                format!(
                    "- {source}: {} records, {} committed, {} unchanged, {} dead-lettered, {} lost",
                    c.records, c.committed, c.unchanged, c.dead_lettered, c.dead_letter_failures
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let duplicates = if self.near_duplicates.is_empty() {
            "- none".to_string()
        } else {
            self.near_duplicates
                .iter()
                .map(|d| format!("- {:.3} `{}` / `{}`", d.score, d.left_address, d.right_address))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "# HomeTrack Ingest Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Messages: {}\n- Records: {}\n- Committed: {}\n- Unchanged: {}\n- Aborted: {}\n- Malformed lines: {}\n- Dead letters not persisted: {}\n- New events: {}\n- New conflicts: {}\n- Indexed properties: {}\n\n## Sources\n{}\n\n## Dead Letters\n{}\n\n## Possible Duplicate Addresses\n{}\n",
            self.run_id,
            self.started_at,
            self.finished_at,
            self.stats.messages,
            self.stats.records,
            self.stats.committed,
            self.stats.unchanged,
            self.stats.aborted,
            self.stats.malformed_lines,
            self.stats.dead_letter_failures,
            self.stats.new_events,
            self.stats.new_conflicts,
            self.indexed_properties,
            sources,
            stages,
            duplicates,
        )
    }
}

/// Writes `<reports_dir>/<run_id>/ingest_summary.json` and `ingest_brief.md`.
pub async fn write_run_report(reports_dir: &Path, summary: &IngestSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing ingest summary")?;
    fs::write(run_dir.join("ingest_summary.json"), json)
        .await
        .context("writing ingest_summary.json")?;
    fs::write(run_dir.join("ingest_brief.md"), summary.brief_markdown())
        .await
        .context("writing ingest_brief.md")?;
    Ok(run_dir)
}
