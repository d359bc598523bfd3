//! Builders for descriptors and descriptor files.

#![allow(dead_code)]

use std::path::PathBuf;

use sheeva::config::{ConfigFile, DesiredState, FreezePeriod, ResourceDescriptor, Variable};

/// Builder for `ResourceDescriptor` instances.
pub struct DescriptorBuilder {
    descriptor: ResourceDescriptor,
}

impl DescriptorBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            descriptor: ResourceDescriptor::new(name, namespace),
        }
    }

    /// A root group: its namespace is its own name.
    pub fn root(name: &str) -> Self {
        Self::new(name, name)
    }

    pub fn state(mut self, state: &str) -> Self {
        self.descriptor.state = DesiredState::from(state.to_string());
        self
    }

    pub fn variable(mut self, key: &str, value: &str) -> Self {
        self.descriptor.variables.push(Variable::new(key, value));
        self
    }

    pub fn clean_variables(mut self) -> Self {
        self.descriptor.clean_unmanaged_variables = true;
        self
    }

    pub fn freeze(mut self, start: &str, end: &str) -> Self {
        self.descriptor.deploy_freezes.push(freeze(start, end));
        self
    }

    pub fn deploy_freeze_file(mut self, path: &str) -> Self {
        self.descriptor.deploy_freeze_file = Some(PathBuf::from(path));
        self
    }

    pub fn renamed_from(mut self, old_name: &str) -> Self {
        self.descriptor.name_old = Some(old_name.to_string());
        self
    }

    pub fn transferred_from(mut self, old_namespace: &str) -> Self {
        self.descriptor.namespace_old = Some(old_namespace.to_string());
        self
    }

    pub fn build(self) -> ResourceDescriptor {
        self.descriptor
    }
}

pub fn freeze(start: &str, end: &str) -> FreezePeriod {
    FreezePeriod {
        freeze_start: start.to_string(),
        freeze_end: end.to_string(),
        cron_timezone: "UTC".to_string(),
    }
}

/// Serializes descriptors into the layout the loader reads.
pub fn descriptor_yaml(groups: Vec<ResourceDescriptor>, projects: Vec<ResourceDescriptor>) -> String {
    serde_yaml::to_string(&ConfigFile { groups, projects }).expect("Failed to serialize descriptors")
}

/// Root group plus `width` children, each with `width` grandchildren.
pub fn group_tree(root: &str, width: usize) -> Vec<ResourceDescriptor> {
    let mut groups = vec![DescriptorBuilder::root(root).build()];
    for i in 0..width {
        let child = format!("g{}", i);
        groups.push(DescriptorBuilder::new(&child, root).build());
        for j in 0..width {
            let namespace = format!("{}/{}", root, child);
            groups.push(DescriptorBuilder::new(&format!("g{}{}", i, j), &namespace).build());
        }
    }
    groups
}
