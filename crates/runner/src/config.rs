//! Runtime config directory loader.
//!
//! Remote runtimes are described by YAML files dropped into a directory
//! (typically a mounted secret). Every file whose name matches the pattern
//! is parsed into a [`RuntimeConfig`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};
use walkdir::WalkDir;

/// File name pattern for runtime config files.
pub const RUNTIME_FILE_PATTERN: &str = r".*\.runtime\.yaml";

/// Connection details of a remote cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    /// PEM encoded CA certificate.
    #[serde(default)]
    pub crt: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub host: String,
    /// Runtime name, matched against a task's `reName`.
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid file pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to read config dir {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Load every config file under `dir` whose file name matches `pattern`.
///
/// Symlinked directories are not descended, so a secret mount's `..data`
/// link does not yield each file twice. Files that cannot be read or parsed
/// are logged and skipped.
///
/// # Errors
/// Returns error if `pattern` is not a valid regex or `dir` cannot be read.
pub fn load(
    dir: impl AsRef<Path>,
    pattern: &str,
) -> Result<BTreeMap<PathBuf, RuntimeConfig>, ConfigError> {
    let re = Regex::new(pattern)?;
    let files = matching_files(dir.as_ref(), &re)?;

    let mut configs = BTreeMap::new();
    for file in files {
        let content = match fs::read_to_string(&file) {
            Ok(content) => content,
            Err(e) => {
                error!(file = %file.display(), error = %e, "Failed to read file content");
                continue;
            }
        };
        match serde_yaml::from_str::<RuntimeConfig>(&content) {
            Ok(config) => {
                configs.insert(file, config);
            }
            Err(e) => {
                error!(file = %file.display(), error = %e, "Failed to parse runtime config");
            }
        }
    }
    Ok(configs)
}

fn matching_files(dir: &Path, re: &Regex) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(source) if source.depth() == 0 => {
                return Err(ConfigError::Dir {
                    path: dir.to_path_buf(),
                    source,
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to visit");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        if re.is_match(&entry.file_name().to_string_lossy()) {
            files.push(entry.into_path());
        } else {
            debug!(file = %entry.path().display(), "File ignored, name does not match pattern");
        }
    }
    Ok(files)
}
