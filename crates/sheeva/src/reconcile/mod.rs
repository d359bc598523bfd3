//! Reconciliation of descriptors against a provider.

pub mod engine;
pub mod resource;
pub mod scheduler;
pub mod subresource;

pub use engine::{Engine, EngineContext, RunReport};
pub use resource::{Outcome, Reconciler};
pub use scheduler::{FailurePolicy, LevelScheduler, PassReport};
pub use subresource::{desired_items, sync, CleanPolicy, Managed, SyncReport};
