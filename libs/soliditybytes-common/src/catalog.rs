// Exercise catalog
// Loads exercise YAML documents from the content root once at startup.

use crate::types::{Exercise, ExerciseSummary};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Track directory whose exercises can be run but are never listed
pub const EXAMPLES_TRACK: &str = "_examples";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("content root not found: {0}")]
    MissingRoot(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("duplicate exercise id '{id}' in {first} and {second}")]
    DuplicateId {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Registry of all exercises found under the content root.
///
/// Every sub-directory of the root is a track. Documents that fail to parse
/// are skipped with a warning so one bad file does not take the server down.
#[derive(Debug, Default)]
pub struct ExerciseCatalog {
    exercises: HashMap<String, Arc<Exercise>>,
    sources: HashMap<String, PathBuf>,
    /// Listed exercise ids, ordered by track then file name
    listed: Vec<String>,
}

impl ExerciseCatalog {
    pub fn load<P: AsRef<Path>>(root: P) -> Result<Self, CatalogError> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(CatalogError::MissingRoot(root.to_path_buf()));
        }

        let mut catalog = ExerciseCatalog::default();
        for track in sorted_entries(root)? {
            if !track.is_dir() {
                continue;
            }
            let track_name = match track.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            for path in sorted_entries(&track)? {
                if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                    continue;
                }
                catalog.load_document(&path, &track_name)?;
            }
        }

        debug!(
            exercises = catalog.exercises.len(),
            listed = catalog.listed.len(),
            root = %root.display(),
            "Exercise catalog loaded"
        );
        Ok(catalog)
    }

    fn load_document(&mut self, path: &Path, track: &str) -> Result<(), CatalogError> {
        let text = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut exercise: Exercise = match serde_yaml::from_str(&text) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unparseable exercise");
                return Ok(());
            }
        };
        if exercise.id.trim().is_empty() {
            warn!(path = %path.display(), "Skipping exercise without id");
            return Ok(());
        }
        exercise.track = track.to_string();

        if let Some(first) = self.sources.get(&exercise.id) {
            return Err(CatalogError::DuplicateId {
                id: exercise.id,
                first: first.clone(),
                second: path.to_path_buf(),
            });
        }

        if track != EXAMPLES_TRACK {
            self.listed.push(exercise.id.clone());
        }
        self.sources.insert(exercise.id.clone(), path.to_path_buf());
        self.exercises.insert(exercise.id.clone(), Arc::new(exercise));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Exercise>> {
        self.exercises.get(id).cloned()
    }

    /// Summaries of listed exercises, optionally restricted to one track.
    pub fn list(&self, track: Option<&str>) -> Vec<ExerciseSummary> {
        self.listed_exercises(track)
            .map(|ex| ex.summary())
            .collect()
    }

    /// Listed exercises; when `track` is given, only that track (which may
    /// be the examples track).
    pub fn listed_exercises<'a>(
        &'a self,
        track: Option<&'a str>,
    ) -> Box<dyn Iterator<Item = Arc<Exercise>> + 'a> {
        match track {
            None => Box::new(self.listed.iter().filter_map(|id| self.get(id))),
            Some(track) => {
                let mut ids: Vec<&String> = self
                    .exercises
                    .values()
                    .filter(|ex| ex.track == track)
                    .map(|ex| &ex.id)
                    .collect();
                ids.sort_by_key(|id| self.sources.get(*id).cloned());
                Box::new(ids.into_iter().filter_map(|id| self.get(id)))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.exercises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exercises.is_empty()
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, CatalogError> {
    let read = fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut entries = Vec::new();
    for entry in read {
        let entry = entry.map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}
