//! Configuration loader for multi-file YAML configurations.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use tracing::debug;
use walkdir::WalkDir;

use super::schema::{ConfigFile, ResourceDescriptor};
use super::validation::ConfigValidator;
use crate::error::ConfigError;

/// Descriptors loaded from the config directory, in file order.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// All group descriptors.
    pub groups: Vec<ResourceDescriptor>,
    /// All project descriptors.
    pub projects: Vec<ResourceDescriptor>,
    /// Files that contributed descriptors, relative to the config directory.
    pub files: Vec<PathBuf>,
}

/// Configuration loader for a directory of YAML files.
pub struct ConfigLoader {
    /// Root directory for configuration files.
    config_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new config loader for the given directory.
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Returns the config directory path.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Loads and validates every descriptor in the config directory.
    ///
    /// Only files directly inside the directory are read. Files are visited
    /// in name order so the resulting lists are stable between runs.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        if !self.config_dir.is_dir() {
            return Err(ConfigError::DirectoryNotFound(self.config_dir.clone()));
        }

        let mut config = LoadedConfig::default();

        for entry in WalkDir::new(&self.config_dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| ConfigError::ReadDirectory {
                path: self.config_dir.clone(),
                source: e,
            })?;
            let path = entry.path();

            if !path.is_file() || is_hidden(path) || !is_yaml(path) {
                continue;
            }

            let file = self.load_file(path)?;
            debug!(
                file = %path.display(),
                groups = file.groups.len(),
                projects = file.projects.len(),
                "Loaded config file"
            );

            config.groups.extend(
                file.groups
                    .into_iter()
                    .map(|g| self.resolve_paths(g)),
            );
            config.projects.extend(
                file.projects
                    .into_iter()
                    .map(|p| self.resolve_paths(p)),
            );
            config.files.push(
                path.strip_prefix(&self.config_dir)
                    .unwrap_or(path)
                    .to_path_buf(),
            );
        }

        ConfigValidator::new().validate(&config)?;

        Ok(config)
    }

    /// Parses a single configuration file.
    pub fn load_file(&self, path: &Path) -> Result<ConfigFile, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        if content.trim().is_empty() {
            return Ok(ConfigFile::default());
        }

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Makes every relative file reference absolute against the config directory.
    fn resolve_paths(&self, mut descriptor: ResourceDescriptor) -> ResourceDescriptor {
        for slot in [
            &mut descriptor.avatar,
            &mut descriptor.variables_file,
            &mut descriptor.webhooks_file,
            &mut descriptor.schedules_file,
            &mut descriptor.deploy_freeze_file,
        ] {
            if let Some(path) = slot.as_mut() {
                if path.is_relative() {
                    *path = self.config_dir.join(&*path);
                }
            }
        }
        descriptor
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Reads an external list file referenced by a descriptor.
///
/// The layout type selects which top-level key is read.
pub async fn read_list_file<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
