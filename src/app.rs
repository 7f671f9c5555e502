use crate::commands::{self, Command, CommandError};
use crate::config::{
    ClientConfig, DEFAULT_API_URL, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_SESSION_FILE, DEFAULT_WS_URL,
    ENV_API_URL, ENV_HTTP_TIMEOUT_SECS, ENV_SESSION_FILE, ENV_WS_URL,
};
use crate::http::ReqwestTransport;
use crate::notifications::NotificationQueue;
use crate::state::{FileBackend, KeyringBackend, SessionController, SessionStore, StorageBackend};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "kys", version, about = "KnowYourStats command-line client")]
pub struct Cli {
    /// Base HTTP origin, including the API prefix
    #[arg(long, global = true, env = ENV_API_URL, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Base origin for streaming connections
    #[arg(long, global = true, env = ENV_WS_URL, default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Where the session is kept between runs
    #[arg(long, global = true, env = ENV_SESSION_FILE, default_value = DEFAULT_SESSION_FILE)]
    session_file: PathBuf,

    /// Keep the session in the OS keychain instead of the session file
    #[arg(long, global = true, env = "KYS_KEYRING")]
    keyring: bool,

    /// Per-request timeout in seconds
    #[arg(long, global = true, env = ENV_HTTP_TIMEOUT_SECS, default_value_t = DEFAULT_HTTP_TIMEOUT_SECS)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    // A second init (e.g. from tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

impl Cli {
    fn config(&self) -> Result<ClientConfig, CommandError> {
        Ok(
            ClientConfig::new(&self.api_url, &self.ws_url)?
                .with_timeout(Duration::from_secs(self.timeout_secs.max(1)))
                .with_session_file(&self.session_file),
        )
    }

    fn backend(&self, config: &ClientConfig) -> Arc<dyn StorageBackend> {
        if self.keyring {
            let keyring = KeyringBackend::new();
            if keyring.is_available() {
                return Arc::new(keyring);
            }
            tracing::warn!("OS keychain is unavailable, falling back to the session file");
        }
        Arc::new(FileBackend::new(config.session_file.clone()))
    }
}

async fn execute(cli: Cli) -> Result<(), CommandError> {
    let config = cli.config()?;
    let store = SessionStore::new(cli.backend(&config));
    let transport = Arc::new(ReqwestTransport::new(config.timeout)?);
    let notifications = NotificationQueue::new();
    let controller = SessionController::bootstrap(config, transport, store, notifications.clone());

    // One-shot process: the profile is only fetched when a command asks for it.
    if let Some(refresh) = controller.initialize().await {
        refresh.abort();
    }

    let result = commands::execute(&controller, cli.command).await;
    for notification in notifications.snapshot() {
        eprintln!("{}", notification.message);
    }

    let output = result?;
    if !output.is_null() {
        let text = serde_json::to_string_pretty(&output)
            .map_err(|e| CommandError::Usage(format!("unprintable output: {e}")))?;
        println!("{text}");
    }
    Ok(())
}

pub async fn run() -> ExitCode {
    // Missing .env is the normal case.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
