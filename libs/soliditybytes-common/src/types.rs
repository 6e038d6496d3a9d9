use serde::{Deserialize, Serialize};
use std::fmt;

/// A single file of exercise content: a relative path plus its text.
///
/// Used for starter, solution and test payloads, and for the overrides a
/// client sends along with a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExerciseFile {
    pub path: String,
    pub content: String,
}

impl ExerciseFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub files: Vec<ExerciseFile>,
}

/// Which file set a submission runs the tests against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Starter,
    Solution,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Starter => write!(f, "starter"),
            Mode::Solution => write!(f, "solution"),
        }
    }
}

/// Who may fetch an exercise's solution files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// Anyone, signed in or not
    Public,
    /// Any signed-in user
    Authenticated,
    /// Signed-in users who have already solved the exercise
    #[default]
    AfterPass,
    /// Nobody through the API
    Hidden,
}

/// An exercise as loaded from static YAML content. Immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exercise {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub starter: FileSet,
    #[serde(default)]
    pub solution: FileSet,
    #[serde(default)]
    pub tests: FileSet,
    #[serde(default)]
    pub visibility: Visibility,
    /// Directory the document was loaded from; not part of the YAML
    #[serde(skip)]
    pub track: String,
}

impl Exercise {
    /// Files materialized for the given mode (tests excluded).
    pub fn files_for(&self, mode: Mode) -> &[ExerciseFile] {
        match mode {
            Mode::Starter => &self.starter.files,
            Mode::Solution => &self.solution.files,
        }
    }

    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or(&self.track)
    }

    pub fn summary(&self) -> ExerciseSummary {
        ExerciseSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            difficulty: self.difficulty.clone(),
            tags: self.tags.clone(),
            category: self.category().to_string(),
        }
    }

    /// Public projection: no solution, and test files reduced to their paths.
    pub fn detail(&self) -> ExerciseDetail {
        ExerciseDetail {
            id: self.id.clone(),
            title: self.title.clone(),
            difficulty: self.difficulty.clone(),
            tags: self.tags.clone(),
            category: self.category().to_string(),
            objectives: self.objectives.clone(),
            description: self.description.clone(),
            hints: self.hints.clone(),
            starter: self.starter.clone(),
            tests: TestPaths {
                files: self
                    .tests
                    .files
                    .iter()
                    .map(|f| TestPath {
                        path: f.path.clone(),
                    })
                    .collect(),
            },
            visibility: self.visibility,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseSummary {
    pub id: String,
    pub title: String,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExerciseDetail {
    pub id: String,
    pub title: String,
    pub difficulty: Option<String>,
    pub tags: Vec<String>,
    pub category: String,
    pub objectives: Vec<String>,
    pub description: String,
    pub hints: Vec<String>,
    pub starter: FileSet,
    pub tests: TestPaths,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPaths {
    pub files: Vec<TestPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPath {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionFiles {
    pub id: String,
    pub files: Vec<ExerciseFile>,
}

/// Identity a submission and its progress are recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requester {
    User(String),
    Device(String),
}

impl Requester {
    /// Key used in the progress store: `user:<id>` or `device:<id>`.
    pub fn key(&self) -> String {
        match self {
            Requester::User(id) => format!("user:{}", id),
            Requester::Device(id) => format!("device:{}", id),
        }
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Which pipe of the subprocess a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of subprocess output, already decoded as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub chunk: String,
}

impl OutputChunk {
    pub fn stdout(chunk: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            chunk: chunk.into(),
        }
    }

    pub fn stderr(chunk: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            chunk: chunk.into(),
        }
    }
}

/// Why a run ended other than by the test command exiting on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneReason {
    Timeout,
    Cancelled,
    InstallFailed,
    SpawnFailed,
    Error,
}

/// Payload of the terminal `done` stream event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneEvent {
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DoneReason>,
}

impl DoneEvent {
    pub fn exited(code: i32) -> Self {
        Self { code, reason: None }
    }

    pub fn with_reason(code: i32, reason: DoneReason) -> Self {
        Self {
            code,
            reason: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0 && self.reason.is_none()
    }
}
