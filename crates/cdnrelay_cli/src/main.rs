use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use cdnrelay_cloud::{CloudStorage, InMemoryCloud, LocalCloud};
use cdnrelay_core::{now_ms, parse_credentials, Relay, RelayConfig, DEFAULT_UPLOAD_TIMEOUT};
use cdnrelay_http::format::format_bytes;
use cdnrelay_http::{build_router, AppState, AutoDeleteConfig, HttpConfig};
use cdnrelay_storage::{open_store, StorageConfig};
use cdnrelay_transfer::{ByteSourceAdapter, QuotaReport};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

const ACCOUNTS_ENV: &str = "CDNRELAY_ACCOUNTS";

#[derive(Debug, Parser)]
#[command(author, version, about = "Upload relay over a pool of cloud storage accounts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP relay.
    Serve {
        #[arg(long, default_value = "config/relay.toml")]
        config: PathBuf,
    },
    /// Delete every file whose scheduled time has passed, then exit.
    Sweep {
        #[arg(long, default_value = "config/relay.toml")]
        config: PathBuf,
    },
    /// Print the storage quota of each account.
    Accounts {
        #[arg(long, default_value = "config/relay.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RuntimeConfig {
    accounts: AccountsSection,
    cloud: CloudSection,
    storage: StorageConfig,
    upload: UploadSection,
    auto_delete: AutoDeleteConfig,
    http: HttpConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AccountsSection {
    /// `email:secret;email:secret`. Overridden by `CDNRELAY_ACCOUNTS`.
    credentials: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CloudBackend {
    #[default]
    Local,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct CloudSection {
    backend: CloudBackend,
    root: PathBuf,
    quota_mb: u64,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            backend: CloudBackend::Local,
            root: PathBuf::from("storage/cloud"),
            quota_mb: 20 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct UploadSection {
    timeout_secs: u64,
    /// Spool inbound files here instead of buffering them in memory.
    spool_dir: Option<PathBuf>,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_UPLOAD_TIMEOUT.as_secs(),
            spool_dir: None,
        }
    }
}

impl UploadSection {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            upload_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            adapter: match &self.spool_dir {
                Some(dir) => ByteSourceAdapter::spool(dir),
                None => ByteSourceAdapter::Memory,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(load_config(&config)?).await,
        Command::Sweep { config } => sweep_once(load_config(&config)?).await,
        Command::Accounts { config } => print_accounts(load_config(&config)?).await,
    }
}

fn load_config(config_path: &PathBuf) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

fn credentials(config: &RuntimeConfig) -> Result<String> {
    let raw = std::env::var(ACCOUNTS_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| config.accounts.credentials.clone())
        .ok_or_else(|| anyhow!("no accounts configured: set {ACCOUNTS_ENV} or [accounts] credentials"))?;
    Ok(raw)
}

fn build_cloud(section: &CloudSection, credentials: &str) -> Arc<dyn CloudStorage> {
    match section.backend {
        CloudBackend::Local => Arc::new(LocalCloud::new(
            &section.root,
            section.quota_mb.saturating_mul(1024 * 1024),
        )),
        CloudBackend::Memory => {
            warn!("memory cloud backend: stored files are lost on exit");
            let cloud = parse_credentials(credentials)
                .into_iter()
                .fold(InMemoryCloud::new(), |cloud, account| {
                    cloud.with_account(&account.email, &account.secret)
                });
            Arc::new(cloud)
        }
    }
}

async fn build_relay(config: &RuntimeConfig) -> Result<Relay> {
    let credentials = credentials(config)?;
    let cloud = build_cloud(&config.cloud, &credentials);
    let store = open_store(&config.storage).await?;
    let relay = Relay::initialize(&credentials, cloud, store, config.upload.relay_config())
        .await
        .context("failed to initialize account pool")?;
    Ok(relay)
}

async fn serve(config: RuntimeConfig) -> Result<()> {
    if config.http.require_auth && config.http.auth_tokens.is_empty() {
        bail!("http.require_auth is set but http.auth_tokens is empty");
    }

    if !requires_token(&config.http.bind) {
        info!("loopback bind detected");
    } else if config.http.require_auth {
        info!("non-loopback bind detected: bearer auth enforced");
    } else {
        warn!(bind = %config.http.bind, "non-loopback bind without http.require_auth: uploads are open");
    }

    let relay = Arc::new(build_relay(&config).await?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = config.auto_delete.enabled.then(|| {
        let every = Duration::from_secs(config.auto_delete.sweep_interval_secs.max(1));
        info!(
            minutes = config.auto_delete.minutes,
            every_secs = every.as_secs(),
            "auto delete enabled"
        );
        tokio::spawn(run_sweeper(relay.clone(), every, stop_rx))
    });

    let state = AppState::new(relay.clone(), config.http.clone(), config.auto_delete.clone());
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, accounts = relay.account_count(), "cdnrelayd listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server failed")?;

    let _ = stop_tx.send(true);
    if let Some(handle) = sweeper {
        if let Err(err) = handle.await {
            warn!(error = %err, "sweeper task ended abnormally");
        }
    }
    relay.cleanup().await;
    Ok(())
}

async fn run_sweeper(relay: Arc<Relay>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = relay.sweep_expired(now_ms()).await {
                    error!(kind = err.kind(), error = %err, "scheduled sweep failed");
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested, draining");
}

async fn sweep_once(config: RuntimeConfig) -> Result<()> {
    let relay = build_relay(&config).await?;
    let report = relay.sweep_report(now_ms()).await?;
    println!(
        "processed {} deleted {} missing {} failed {}",
        report.processed, report.deleted, report.missing, report.failed
    );
    relay.store().close().await;
    Ok(())
}

async fn print_accounts(config: RuntimeConfig) -> Result<()> {
    let relay = build_relay(&config).await?;
    for report in relay.storage_info().await {
        match report {
            QuotaReport::Usage {
                email,
                used,
                total,
                available,
            } => println!(
                "{email}\t{} / {} ({} free)",
                format_bytes(used),
                format_bytes(total),
                format_bytes(available)
            ),
            QuotaReport::Unavailable { email, error } => println!("{email}\t{error}"),
        }
    }
    relay.store().close().await;
    Ok(())
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
