//! Messages the pipeline could not process, kept with the stage that failed
//! and enough context to replay them.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    Intake,
    Identity,
    Merge,
    Commit,
}

impl FailureStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Identity => "identity",
            Self::Merge => "merge",
            Self::Commit => "commit",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub source_id: String,
    pub stage: FailureStage,
    /// Short machine-readable error class, e.g. `validation` or `commit-conflict`.
    pub error_kind: String,
    pub reason: String,
    pub attempts: usize,
    /// The record (or whole message) exactly as it was received.
    pub payload: JsonValue,
}

impl DeadLetter {
    pub fn new(
        source_id: impl Into<String>,
        stage: FailureStage,
        error_kind: impl Into<String>,
        reason: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            failed_at: Utc::now(),
            message_id: None,
            source_id: source_id.into(),
            stage,
            error_kind: error_kind.into(),
            reason: reason.into(),
            attempts: 1,
            payload,
        }
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Identical failures of the same payload share a hash so the archive
    /// keeps one copy of each.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.stage.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.error_kind.as_bytes());
        hasher.update([0]);
        hasher.update(self.source_id.as_bytes());
        hasher.update([0]);
        hasher.update(self.payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn route(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ArchivedLetter {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub deduplicated: bool,
}

/// File-backed sink: `<root>/<yyyymmdd>/<stage>/<hash>.json`, written through
/// a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct DeadLetterArchive {
    root: PathBuf,
}

impl DeadLetterArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn relative_path(&self, letter: &DeadLetter, content_hash: &str) -> PathBuf {
        PathBuf::from(letter.failed_at.format("%Y%m%d").to_string())
            .join(letter.stage.as_str())
            .join(format!("{content_hash}.json"))
    }

    pub async fn store(&self, letter: &DeadLetter) -> anyhow::Result<ArchivedLetter> {
        let content_hash = letter.content_hash();
        let relative_path = self.relative_path(letter, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating dead-letter directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking dead-letter path {}", absolute_path.display()))?
        {
            return Ok(ArchivedLetter {
                content_hash,
                relative_path,
                absolute_path,
                deduplicated: true,
            });
        }

        let bytes = serde_json::to_vec_pretty(letter).context("encoding dead letter")?;
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp dead-letter file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp dead-letter file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp dead-letter file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedLetter {
                content_hash,
                relative_path,
                absolute_path,
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedLetter {
                    content_hash,
                    relative_path,
                    absolute_path,
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming dead letter into place {}", absolute_path.display())
                })
            }
        }
    }

    /// Every archived letter, oldest day first, for inspection or replay.
    pub async fn load_all(&self) -> anyhow::Result<Vec<DeadLetter>> {
        let mut letters = Vec::new();
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(letters);
        }
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("listing dead-letter directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    let bytes = fs::read(&path)
                        .await
                        .with_context(|| format!("reading dead letter {}", path.display()))?;
                    match serde_json::from_slice::<DeadLetter>(&bytes) {
                        Ok(letter) => letters.push(letter),
                        Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable dead letter"),
                    }
                }
            }
        }
        letters.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(letters)
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterArchive {
    async fn route(&self, letter: DeadLetter) -> anyhow::Result<()> {
        self.store(&letter).await.map(|_| ())
    }
}

/// Keeps letters in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn route(&self, letter: DeadLetter) -> anyhow::Result<()> {
        self.letters.lock().await.push(letter);
        Ok(())
    }
}
