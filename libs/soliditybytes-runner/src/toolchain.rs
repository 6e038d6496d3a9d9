// Toolchain configuration for the exercise runner
use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// File in the workspace holding the hash of the last installed manifest
pub const HASH_MARKER: &str = ".deps-hash";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolchainCommand {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// The dependency manifest written into every workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSpec {
    /// Manifest file name relative to the workspace
    pub file: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct PackageManifest<'a> {
    name: &'a str,
    private: bool,
    version: &'a str,
    scripts: &'a BTreeMap<String, String>,
    dependencies: &'a BTreeMap<String, String>,
}

/// Project config the test runner expects; written only when the exercise
/// files do not already provide one of the accepted names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfigFile {
    pub path: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
    pub content: String,
}

/// Describes the external test toolchain: how to install dependencies, how
/// to run the tests, and which workspace entries survive between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolchainConfig {
    pub name: String,
    pub install: ToolchainCommand,
    pub test: ToolchainCommand,
    pub manifest: ManifestSpec,
    /// Dependency cache directory, relative to the workspace
    pub cache_dir: String,
    pub project_config: ProjectConfigFile,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let (npm, npx) = if cfg!(windows) {
            ("npm.cmd", "npx.cmd")
        } else {
            ("npm", "npx")
        };

        let dependencies = [
            ("hardhat", "^2.22.5"),
            ("@nomicfoundation/hardhat-toolbox", "^4.0.0"),
            ("ethers", "^6.12.0"),
            ("chai", "^4.3.10"),
            ("mocha", "^10.4.0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            name: "hardhat".to_string(),
            install: ToolchainCommand::new(npm, &["i", "--silent"]),
            test: ToolchainCommand::new(npx, &["hardhat", "test"]),
            manifest: ManifestSpec {
                file: "package.json".to_string(),
                name: "exercise-runner".to_string(),
                version: "0.0.0".to_string(),
                scripts: BTreeMap::from([("test".to_string(), "hardhat test".to_string())]),
                dependencies,
            },
            cache_dir: "node_modules".to_string(),
            project_config: ProjectConfigFile {
                path: "hardhat.config.cjs".to_string(),
                alternatives: vec!["hardhat.config.js".to_string()],
                content: "require(\"@nomicfoundation/hardhat-toolbox\");module.exports={solidity:\"0.8.20\"};"
                    .to_string(),
            },
        }
    }
}

impl ToolchainConfig {
    /// Load a toolchain description from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| RunnerError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&content).map_err(|e| RunnerError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load from `path` when it exists, otherwise use the built-in Hardhat
    /// toolchain. A file that exists but does not parse is still an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let config = Self::load(path)?;
            info!(path = %path.display(), toolchain = %config.name, "Loaded toolchain config");
            Ok(config)
        } else {
            debug!(path = %path.display(), "No toolchain config; using defaults");
            Ok(Self::default())
        }
    }

    /// Manifest contents; deterministic for a given config.
    pub fn render_manifest(&self) -> Result<String> {
        let manifest = PackageManifest {
            name: &self.manifest.name,
            private: true,
            version: &self.manifest.version,
            scripts: &self.manifest.scripts,
            dependencies: &self.manifest.dependencies,
        };
        serde_json::to_string_pretty(&manifest).map_err(|e| RunnerError::Config {
            path: self.manifest.file.clone().into(),
            reason: e.to_string(),
        })
    }

    /// Workspace entries that survive the pre-run clear
    pub fn preserved_entries(&self) -> [&str; 2] {
        [self.cache_dir.as_str(), HASH_MARKER]
    }

    /// Names accepted as an already-present project config
    pub fn project_config_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.project_config.path.as_str())
            .chain(self.project_config.alternatives.iter().map(|s| s.as_str()))
    }

    /// Check that every toolchain program resolves on PATH
    pub fn preflight(&self) -> Result<()> {
        for program in [&self.install.command, &self.test.command] {
            which::which(program)
                .map_err(|_| RunnerError::ToolchainMissing(program.clone()))?;
        }
        Ok(())
    }
}
