pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{read_list_file, ConfigLoader, LoadedConfig};
pub use schema::{
    ConfigFile, DesiredState, FreezePeriod, FreezePeriodsFile, ResourceDescriptor, ResourceKind,
    Schedule, SchedulesFile, Variable, VariablesFile, Webhook, WebhooksFile,
};
pub use validation::ConfigValidator;
