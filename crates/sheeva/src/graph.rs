//! Hierarchy graph built from flat group descriptors.
//!
//! Each root group (a descriptor whose namespace is its own name) becomes the
//! root of a tree. Every other descriptor is attached to the roots its
//! namespace belongs to, bucketed by depth level so the scheduler can walk
//! one level at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ResourceDescriptor, ResourceKind};

/// How a descriptor's namespace is matched against a root group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMatching {
    /// The namespace contains the root name anywhere. A root named `team`
    /// also claims descriptors under `other-team/x`.
    Substring,
    /// The namespace is the root path or starts with `root/`.
    #[default]
    #[serde(rename = "prefix", alias = "path-prefix")]
    PathPrefix,
}

impl NamespaceMatching {
    /// Returns true if `namespace` belongs to the tree rooted at `root`.
    pub fn matches(&self, namespace: &str, root: &str) -> bool {
        match self {
            NamespaceMatching::Substring => namespace.contains(root),
            NamespaceMatching::PathPrefix => {
                namespace == root
                    || namespace
                        .strip_prefix(root)
                        .map(|rest| rest.starts_with('/'))
                        .unwrap_or(false)
            }
        }
    }
}

impl std::fmt::Display for NamespaceMatching {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceMatching::Substring => write!(f, "substring"),
            NamespaceMatching::PathPrefix => write!(f, "prefix"),
        }
    }
}

impl std::str::FromStr for NamespaceMatching {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "substring" => Ok(NamespaceMatching::Substring),
            "prefix" | "path-prefix" => Ok(NamespaceMatching::PathPrefix),
            _ => Err(format!("Unknown namespace matching: {}", s)),
        }
    }
}

/// A node of the hierarchy graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    descriptor: Arc<ResourceDescriptor>,
    levels: BTreeMap<usize, Vec<GraphNode>>,
}

impl GraphNode {
    pub fn new(descriptor: Arc<ResourceDescriptor>) -> Self {
        Self {
            descriptor,
            levels: BTreeMap::new(),
        }
    }

    pub fn descriptor(&self) -> &Arc<ResourceDescriptor> {
        &self.descriptor
    }

    /// Attaches a descendant at the given depth level.
    pub fn add_node(&mut self, descriptor: Arc<ResourceDescriptor>, level: usize) {
        self.levels
            .entry(level)
            .or_default()
            .push(GraphNode::new(descriptor));
    }

    /// Descendants at one level. Order within the level is unspecified.
    pub fn level_nodes(&self, level: usize) -> &[GraphNode] {
        self.levels.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Levels in ascending order with their nodes.
    pub fn levels(&self) -> impl Iterator<Item = (usize, &[GraphNode])> {
        self.levels.iter().map(|(level, nodes)| (*level, nodes.as_slice()))
    }

    pub fn max_level(&self) -> usize {
        self.levels.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of descendants across all levels.
    pub fn descendant_count(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }
}

/// The set of root trees, plus descriptors no root claimed.
#[derive(Debug, Clone, Default)]
pub struct Forest {
    pub roots: Vec<GraphNode>,
    pub unrooted: Vec<Arc<ResourceDescriptor>>,
}

impl Forest {
    /// Unrooted descriptors bucketed by level, ascending.
    pub fn unrooted_levels(&self) -> BTreeMap<usize, Vec<Arc<ResourceDescriptor>>> {
        let mut levels: BTreeMap<usize, Vec<Arc<ResourceDescriptor>>> = BTreeMap::new();
        for desc in &self.unrooted {
            levels.entry(desc.level()).or_default().push(Arc::clone(desc));
        }
        levels
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.unrooted.is_empty()
    }
}

/// Builds the forest from a flat, unordered list of group descriptors.
///
/// Roots are never attached below another root. With
/// [`NamespaceMatching::Substring`] a descriptor may land in several trees.
pub fn build_forest(descriptors: &[Arc<ResourceDescriptor>], matching: NamespaceMatching) -> Forest {
    let mut roots: Vec<GraphNode> = descriptors
        .iter()
        .filter(|d| d.is_root(ResourceKind::Group))
        .map(|d| GraphNode::new(Arc::clone(d)))
        .collect();

    let mut unrooted = Vec::new();

    for desc in descriptors.iter().filter(|d| !d.is_root(ResourceKind::Group)) {
        let level = desc.level();
        let mut attached = false;

        for root in roots.iter_mut() {
            if matching.matches(&desc.namespace, &root.descriptor.name) {
                root.add_node(Arc::clone(desc), level);
                attached = true;
            }
        }

        if !attached {
            unrooted.push(Arc::clone(desc));
        }
    }

    Forest { roots, unrooted }
}
