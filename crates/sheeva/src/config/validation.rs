//! Cross-descriptor validation for loaded configuration.

use std::collections::HashSet;

use super::loader::LoadedConfig;
use super::schema::{ResourceDescriptor, ResourceKind};
use crate::error::ConfigError;

/// Validator for loaded descriptors.
pub struct ConfigValidator {
    /// Collected validation errors.
    errors: Vec<String>,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Returns the errors collected by the last validation.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Validates every group and project descriptor.
    pub fn validate(&mut self, config: &LoadedConfig) -> Result<(), ConfigError> {
        self.errors.clear();

        for group in &config.groups {
            self.validate_descriptor(ResourceKind::Group, group);
        }
        for project in &config.projects {
            self.validate_descriptor(ResourceKind::Project, project);
        }

        self.validate_unique_paths(ResourceKind::Group, &config.groups);
        self.validate_unique_paths(ResourceKind::Project, &config.projects);

        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(self.errors.join("; ")))
        }
    }

    fn validate_descriptor(&mut self, kind: ResourceKind, desc: &ResourceDescriptor) {
        let label = format!("{} '{}'", kind, desc.full_path(kind));

        if desc.name.trim().is_empty() {
            self.errors.push(format!("{}: name is required", label));
        }
        if desc.name.contains('/') {
            self.errors
                .push(format!("{}: name must not contain '/'", label));
        }
        if desc.namespace.trim().is_empty() {
            self.errors.push(format!("{}: namespace is required", label));
        }

        let mut seen = HashSet::new();
        for variable in &desc.variables {
            if variable.key.trim().is_empty() {
                self.errors
                    .push(format!("{}: variable key is required", label));
            } else if !seen.insert((variable.key.as_str(), variable.environment.as_str())) {
                self.errors.push(format!(
                    "{}: duplicate variable '{}' for environment '{}'",
                    label, variable.key, variable.environment
                ));
            }
        }

        for schedule in &desc.schedules {
            if schedule.cron.trim().is_empty() {
                self.errors.push(format!(
                    "{}: schedule '{}' has an empty cron expression",
                    label, schedule.description
                ));
            }
            if schedule.git_ref.trim().is_empty() {
                self.errors.push(format!(
                    "{}: schedule '{}' has an empty ref",
                    label, schedule.description
                ));
            }
        }

        for hook in &desc.webhooks {
            if hook.url.trim().is_empty() {
                self.errors
                    .push(format!("{}: webhook url is required", label));
            }
        }

        for freeze in &desc.deploy_freezes {
            if freeze.freeze_start.trim().is_empty() || freeze.freeze_end.trim().is_empty() {
                self.errors.push(format!(
                    "{}: deploy freeze needs both freeze_start and freeze_end",
                    label
                ));
            }
        }
    }

    fn validate_unique_paths(&mut self, kind: ResourceKind, descriptors: &[ResourceDescriptor]) {
        let mut seen = HashSet::new();
        for desc in descriptors {
            let path = desc.full_path(kind);
            if !seen.insert(path.clone()) {
                self.errors
                    .push(format!("Duplicate {} path '{}'", kind, path));
            }
        }
    }
}
