//! sheeva - reconcile GitLab groups and projects from YAML descriptors.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use tracing::{error, info};

use sheeva::logging::{self, LogFormat};
use sheeva::{
    ConfigLoader, Engine, EngineContext, EngineSettings, FailurePolicy, GitLabOptions,
    GitLabProvider, NamespaceMatching, Result,
};

#[derive(Parser)]
#[command(name = "sheeva")]
#[command(about = "Declarative GitLab group and project reconciler", long_about = None)]
#[command(version)]
struct Cli {
    /// GitLab instance URL
    #[arg(long, env = "GITLAB_URL")]
    url: String,

    /// Personal access token with api scope
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    token: String,

    /// Directory holding the descriptor YAML files
    #[arg(long, env = "ROOT_DIR", default_value = "./projects")]
    dir: PathBuf,

    /// Reconciliation tasks allowed in flight (default: twice the CPU count)
    #[arg(long, env = "SHEEVA_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// fail-fast or isolated
    #[arg(long, env = "SHEEVA_FAILURE_POLICY", default_value = "fail-fast")]
    failure_policy: FailurePolicy,

    /// prefix or substring
    #[arg(long, env = "SHEEVA_NAMESPACE_MATCHING", default_value = "prefix")]
    namespace_matching: NamespaceMatching,

    /// HTTP request timeout in seconds
    #[arg(long, env = "SHEEVA_HTTP_TIMEOUT", default_value_t = 20)]
    timeout_secs: u64,

    /// Accept invalid TLS certificates
    #[arg(long, env = "SHEEVA_INSECURE")]
    insecure: bool,

    /// text or json
    #[arg(long, env = "SHEEVA_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Reconciliation failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let loader = ConfigLoader::new(cli.dir.clone());
    let config = loader.load()?;
    info!(
        dir = %cli.dir.display(),
        files = config.files.len(),
        groups = config.groups.len(),
        projects = config.projects.len(),
        "Configuration loaded"
    );

    let provider = GitLabProvider::new(GitLabOptions {
        base_url: cli.url,
        token: SecretString::from(cli.token),
        timeout: Duration::from_secs(cli.timeout_secs),
        insecure: cli.insecure,
    })?;

    let mut settings = EngineSettings::default()
        .with_failure_policy(cli.failure_policy)
        .with_namespace_matching(cli.namespace_matching);
    if let Some(max) = cli.max_concurrency {
        settings = settings.with_max_concurrency(max);
    }
    info!(
        max_concurrency = settings.max_concurrency,
        failure_policy = %settings.failure_policy,
        "Starting reconciliation"
    );

    let engine = Engine::new(EngineContext::new(Arc::new(provider), settings, config))?;
    engine.run().await?;
    Ok(())
}
