//! Declarative GitLab group and project reconciler.
//!
//! Descriptors loaded from a directory of YAML files are reconciled against a
//! [`provider::ResourceProvider`]. Groups are processed level by level so a
//! parent always exists before its children; projects and the propagation
//! of group deploy freezes follow.

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod provider;
pub mod reconcile;
pub mod settings;

pub use config::{ConfigLoader, DesiredState, LoadedConfig, ResourceDescriptor, ResourceKind};
pub use error::{ConfigError, ProviderError, Result, SheevaError};
pub use graph::{build_forest, Forest, GraphNode, NamespaceMatching};
pub use provider::{GitLabOptions, GitLabProvider, InMemoryProvider, ResourceProvider};
pub use reconcile::{Engine, EngineContext, FailurePolicy, Outcome, PassReport, RunReport};
pub use settings::EngineSettings;
