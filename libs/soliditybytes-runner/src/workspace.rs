/// Workspace Manager - Per-Exercise Working Directories
///
/// **Responsibility:**
/// Turn an exercise, a mode and client overrides into a directory the
/// toolchain can run in, reusing installed dependencies when the manifest
/// has not changed.
///
/// **Layout:** `<root>/<sanitized exercise id>/`. Only the dependency cache
/// and its hash marker survive between runs; everything else is rewritten.
use crate::error::{Result, RunnerError};
use crate::process::{CommandSpec, OutputSink, ProcessRunner, RunStatus};
use crate::toolchain::{ToolchainConfig, HASH_MARKER};
use sha2::{Digest, Sha256};
use soliditybytes_common::types::{Exercise, ExerciseFile, Mode};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedWorkspace {
    pub path: PathBuf,
    /// Whether dependencies were installed on this run
    pub installed: bool,
    pub manifest_hash: String,
}

pub struct WorkspaceManager {
    root: PathBuf,
    toolchain: Arc<ToolchainConfig>,
    runner: ProcessRunner,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Directory name for an exercise id: anything outside `[A-Za-z0-9_-]`
/// becomes `_`.
pub fn sanitize_id(exercise_id: &str) -> String {
    let name: String = exercise_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

/// Reject absolute paths and any `..` component.
pub fn validate_relative(path: &str) -> Result<()> {
    let candidate = Path::new(path);
    if path.is_empty() || candidate.is_absolute() {
        return Err(RunnerError::InvalidPath(path.to_string()));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(RunnerError::InvalidPath(path.to_string())),
        }
    }
    Ok(())
}

pub fn manifest_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, toolchain: Arc<ToolchainConfig>) -> Self {
        Self {
            root: root.into(),
            toolchain,
            runner: ProcessRunner::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace_dir(&self, exercise_id: &str) -> PathBuf {
        self.root.join(sanitize_id(exercise_id))
    }

    /// Reject paths that are absolute, climb with `..`, name no file, or
    /// land in the dependency cache or its marker (only install writes
    /// those).
    pub fn validate_path(&self, path: &str) -> Result<()> {
        validate_relative(path)?;
        let first = Path::new(path).components().find_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        });
        match first {
            Some(first)
                if !self
                    .toolchain
                    .preserved_entries()
                    .iter()
                    .any(|keep| first == *keep) =>
            {
                Ok(())
            }
            _ => Err(RunnerError::InvalidPath(path.to_string())),
        }
    }

    /// Exclusive access to one exercise's workspace. Held across prepare
    /// and the test run; different exercises never contend.
    pub async fn lock(&self, exercise_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(sanitize_id(exercise_id))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Materialize `exercise` for `mode` with `overrides` applied last, and
    /// install dependencies when needed. Install output goes to `sink`.
    ///
    /// Callers are expected to hold [`WorkspaceManager::lock`].
    pub async fn prepare(
        &self,
        exercise: &Exercise,
        mode: Mode,
        overrides: &[ExerciseFile],
        sink: &dyn OutputSink,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<PreparedWorkspace> {
        let files = exercise.files_for(mode);
        if files.is_empty() {
            return Err(RunnerError::MissingFiles {
                id: exercise.id.clone(),
                section: match mode {
                    Mode::Starter => "starter",
                    Mode::Solution => "solution",
                },
            });
        }
        if exercise.tests.files.is_empty() {
            return Err(RunnerError::MissingFiles {
                id: exercise.id.clone(),
                section: "tests",
            });
        }

        let ordered: Vec<&ExerciseFile> = files
            .iter()
            .chain(exercise.tests.files.iter())
            .chain(overrides.iter())
            .collect();
        for file in &ordered {
            self.validate_path(&file.path)?;
        }

        let dir = self.workspace_dir(&exercise.id);
        tokio::fs::create_dir_all(&dir).await?;
        self.clear(&dir).await?;

        for file in &ordered {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, file.content.as_bytes()).await?;
        }

        let has_project_config = self
            .toolchain
            .project_config_names()
            .any(|name| dir.join(name).exists());
        if !has_project_config {
            let config = &self.toolchain.project_config;
            tokio::fs::write(dir.join(&config.path), config.content.as_bytes()).await?;
        }

        let manifest_path = dir.join(&self.toolchain.manifest.file);
        let manifest = if manifest_path.exists() {
            tokio::fs::read(&manifest_path).await?
        } else {
            let rendered = self.toolchain.render_manifest()?;
            tokio::fs::write(&manifest_path, rendered.as_bytes()).await?;
            rendered.into_bytes()
        };
        let hash = manifest_hash(&manifest);

        let installed = if self.needs_install(&dir, &hash).await {
            self.install(&dir, &hash, sink, deadline, cancel).await?;
            true
        } else {
            debug!(exercise_id = %exercise.id, "Dependency cache is current");
            false
        };

        Ok(PreparedWorkspace {
            path: dir,
            installed,
            manifest_hash: hash,
        })
    }

    async fn clear(&self, dir: &Path) -> Result<()> {
        let preserved = self.toolchain.preserved_entries();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if preserved.iter().any(|keep| name.as_os_str() == *keep) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
            } else {
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn needs_install(&self, dir: &Path, hash: &str) -> bool {
        if !dir.join(&self.toolchain.cache_dir).is_dir() {
            return true;
        }
        match tokio::fs::read_to_string(dir.join(HASH_MARKER)).await {
            Ok(marker) => marker.trim() != hash,
            Err(_) => true,
        }
    }

    async fn install(
        &self,
        dir: &Path,
        hash: &str,
        sink: &dyn OutputSink,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(workspace = %dir.display(), toolchain = %self.toolchain.name, "Installing dependencies");
        let spec = CommandSpec::from_toolchain(&self.toolchain.install, dir);

        match self.runner.run(&spec, sink, deadline, cancel).await? {
            RunStatus::Exited(0) => {
                tokio::fs::write(dir.join(HASH_MARKER), hash).await?;
                Ok(())
            }
            RunStatus::Exited(code) => Err(RunnerError::Install { code }),
            interrupted => Err(RunnerError::Interrupted(interrupted)),
        }
    }
}
