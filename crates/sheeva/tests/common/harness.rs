//! Isolated environment for end-to-end runs.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sheeva::config::{ConfigLoader, LoadedConfig, ResourceDescriptor};
use sheeva::error::ConfigError;
use sheeva::provider::InMemoryProvider;
use sheeva::{Engine, EngineContext, EngineSettings, RunReport};

use super::builders::descriptor_yaml;

pub struct TestHarness {
    /// Keeps the directory alive for the lifetime of the harness.
    temp_dir: TempDir,
    pub config_dir: PathBuf,
    pub provider: Arc<InMemoryProvider>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_provider(InMemoryProvider::new())
    }

    /// Every provider call sleeps for `latency` so concurrent work overlaps.
    pub fn with_latency(latency: Duration) -> Self {
        Self::with_provider(InMemoryProvider::new().with_latency(latency))
    }

    fn with_provider(provider: InMemoryProvider) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config_dir = temp_dir.path().join("projects");
        fs::create_dir_all(&config_dir).expect("Failed to create config directory");

        Self {
            temp_dir,
            config_dir,
            provider: Arc::new(provider),
        }
    }

    /// Writes a file relative to the config directory.
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.config_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    pub fn write_descriptors(
        &self,
        name: &str,
        groups: Vec<ResourceDescriptor>,
        projects: Vec<ResourceDescriptor>,
    ) -> PathBuf {
        self.write(name, &descriptor_yaml(groups, projects))
    }

    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        ConfigLoader::new(&self.config_dir).load()
    }

    pub fn engine(&self, settings: EngineSettings) -> Engine {
        let config = self.load().expect("Failed to load descriptors");
        Engine::new(EngineContext::new(self.provider.clone(), settings, config))
            .expect("Failed to build engine")
    }

    pub async fn run(&self, settings: EngineSettings) -> sheeva::Result<RunReport> {
        self.engine(settings).run().await
    }
}
