use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SheevaError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provider error while trying to {operation} '{resource}': {source}")]
    Provider {
        resource: String,
        operation: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("Parent namespace '{parent}' of '{resource}' does not exist")]
    MissingParent { resource: String, parent: String },

    #[error("Reconciliation task panicked: {0}")]
    TaskPanicked(String),

    #[error("{failed} resource(s) failed during the {pass} pass: {}", messages.join("; "))]
    Batch {
        pass: &'static str,
        failed: usize,
        messages: Vec<String>,
    },

    #[error("Invalid settings: {0}")]
    Settings(String),
}

impl SheevaError {
    /// Wraps a provider failure with the identity of the resource it concerned.
    pub fn provider(
        resource: impl Into<String>,
        operation: &'static str,
        source: ProviderError,
    ) -> Self {
        SheevaError::Provider {
            resource: resource.into(),
            operation,
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read config directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML in '{path}': {message}")]
    ParseYaml { path: PathBuf, message: String },

    #[error("Config validation failed: {0}")]
    Validation(String),
}

/// Errors surfaced by a [`crate::provider::ResourceProvider`].
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("{operation} failed with HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ProviderError::AlreadyExists(_))
    }
}

pub type Result<T> = std::result::Result<T, SheevaError>;
