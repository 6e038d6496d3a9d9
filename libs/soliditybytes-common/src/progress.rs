use crate::types::Requester;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

// Progress store semantics
// Records which exercises a requester has solved. Marks are monotonic:
// nothing in this module ever clears one.

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("progress store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize progress: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Exercise ids solved by `requester`; empty when unknown.
    async fn read(&self, requester: &Requester) -> Result<BTreeSet<String>, ProgressError>;

    /// Record `exercise_id` as solved by `requester`. Idempotent.
    async fn mark_solved(&self, requester: &Requester, exercise_id: &str)
        -> Result<(), ProgressError>;
}

/// One requester's entry in the progress file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default)]
    pub solved: BTreeMap<String, bool>,
}

type ProgressDocument = BTreeMap<String, ProgressRecord>;

/// Progress kept in a single JSON file keyed by requester key.
///
/// Writers are serialized through an async mutex and each write goes to a
/// temporary file that is renamed over the original, so concurrent
/// completions cannot drop each other's marks.
pub struct JsonFileProgressStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Where an unreadable progress file is moved before it is replaced
    fn corrupt_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }

    /// Read the whole document. A corrupt file reads as empty; when
    /// `set_aside` is true it is also moved to [`Self::corrupt_path`] so the
    /// next save cannot destroy it.
    async fn load(&self, set_aside: bool) -> Result<ProgressDocument, ProgressError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(ProgressError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(e) if set_aside => {
                let moved_to = self.corrupt_path();
                tokio::fs::rename(&self.path, &moved_to)
                    .await
                    .map_err(|source| ProgressError::Io {
                        path: self.path.clone(),
                        source,
                    })?;
                warn!(
                    path = %self.path.display(),
                    moved_to = %moved_to.display(),
                    error = %e,
                    "Progress file is corrupt; moved aside"
                );
                Ok(BTreeMap::new())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Progress file is corrupt; treating as empty");
                Ok(BTreeMap::new())
            }
        }
    }

    async fn save(&self, doc: &ProgressDocument) -> Result<(), ProgressError> {
        let io_err = |source: std::io::Error| ProgressError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let payload = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl ProgressStore for JsonFileProgressStore {
    async fn read(&self, requester: &Requester) -> Result<BTreeSet<String>, ProgressError> {
        let doc = self.load(false).await?;
        Ok(doc
            .get(&requester.key())
            .map(|record| {
                record
                    .solved
                    .iter()
                    .filter(|(_, solved)| **solved)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_solved(
        &self,
        requester: &Requester,
        exercise_id: &str,
    ) -> Result<(), ProgressError> {
        let _guard = self.write_lock.lock().await;

        let mut doc = self.load(true).await?;
        let record = doc.entry(requester.key()).or_default();
        if record.solved.get(exercise_id) == Some(&true) {
            return Ok(());
        }
        record.solved.insert(exercise_id.to_string(), true);
        self.save(&doc).await?;

        debug!(requester = %requester, exercise_id = %exercise_id, "Progress recorded");
        Ok(())
    }
}
