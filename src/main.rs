mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tether_engine::{Orchestrator, QrSvgRenderer};
use tether_protocol::MockClientFactory;
use tether_store::{Database, SqliteGateway, Vault};
use tether_telemetry::SqliteLogSink;

use settings::{Backend, TetherSettings};

const LOG_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Multi-tenant session orchestrator for linked messaging identities.
#[derive(Debug, Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// Settings file (defaults to ~/.tether/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path, or `:memory:`.
    #[arg(long)]
    db: Option<String>,
    #[arg(long, value_enum)]
    backend: Option<Backend>,
}

impl Cli {
    fn apply(&self, settings: &mut TetherSettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = &self.db {
            settings.storage.db_path = db.clone();
        }
        if let Some(backend) = self.backend {
            settings.backend = backend;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.config.clone().unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;
    cli.apply(&mut settings);
    settings.validate()?;

    if settings.logging.log_to_sqlite {
        if let Some(parent) = PathBuf::from(&settings.logging.log_db_path).parent() {
            std::fs::create_dir_all(parent).context("creating log directory")?;
        }
    }
    let telemetry = tether_telemetry::init_telemetry(settings.telemetry_config());

    tracing::info!(
        config = %settings_path.display(),
        backend = ?settings.backend,
        "Starting tether"
    );

    let store = Arc::new(open_store(&settings)?);
    let factory = match settings.backend {
        Backend::Simulated => {
            let factory = MockClientFactory::new();
            factory
                .script()
                .auto_pair_after(settings.simulator.auto_pair_after_secs.map(Duration::from_secs));
            Arc::new(factory)
        }
    };

    let orchestrator = Arc::new(
        Orchestrator::new(
            settings.orchestrator_config(),
            store,
            factory,
            Arc::new(QrSvgRenderer::default()),
        )
        .context("starting orchestrator")?,
    );
    orchestrator.start_health_monitor();

    let logs = telemetry.logs();
    let pruner = match (&logs, settings.logging.retention_days) {
        (Some(sink), days) if days > 0 => Some(spawn_log_pruner(Arc::clone(sink), days)),
        _ => None,
    };

    let server = tether_server::start(settings.server_config(), orchestrator.clone(), logs)
        .await
        .context("starting server")?;
    tracing::info!(port = server.port, "Tether ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl+c")?;

    tracing::info!("Shutting down");
    server.shutdown().await;
    orchestrator.shutdown().await;
    if let Some(pruner) = pruner {
        pruner.abort();
    }
    Ok(())
}

/// Drop persisted log records past retention, at startup and then hourly.
fn spawn_log_pruner(sink: Arc<SqliteLogSink>, retention_days: u32) -> tokio::task::JoinHandle<()> {
    let retention = chrono::Duration::days(i64::from(retention_days));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOG_PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            match sink.prune_older_than(retention) {
                Ok(0) => {}
                Ok(pruned) => tracing::info!(pruned, retention_days, "pruned old log records"),
                Err(e) => tracing::warn!(error = %e, "log pruning failed"),
            }
        }
    })
}

/// Open the database and the identity vault. Failure here is fatal.
fn open_store(settings: &TetherSettings) -> anyhow::Result<SqliteGateway> {
    if settings.storage.is_in_memory() {
        tracing::warn!("using an in-memory database; nothing survives a restart");
        let db = Database::in_memory().context("opening in-memory database")?;
        return Ok(SqliteGateway::new(db, Vault::ephemeral()));
    }

    let db_path = PathBuf::from(&settings.storage.db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    let key_path = PathBuf::from(&settings.storage.key_path);
    let vault = Vault::load_or_create(&key_path)
        .with_context(|| format!("loading vault key {}", key_path.display()))?;
    Ok(SqliteGateway::new(db, vault))
}
