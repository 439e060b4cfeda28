mod banner;
mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use upshift_config::{ConfigLoader, UpgradeConfig};
use upshift_db::steps::{self, CURRENT_VERSION};
use upshift_db::{SqliteOpener, SqliteStore, Store};
use upshift_security::KeyringCredentialStore;
use upshift_upgrade::{Requestor, TriggerResult, UpgradeCoordinator};

/// Keychain service under which migrated API keys are stored.
const KEYRING_SERVICE: &str = "upshift";

#[derive(Parser, Debug)]
#[command(name = "upshift", version, about = "Upgrade an upshift SQLite store to the current schema")]
struct Cli {
    /// Config file (.yml, .yaml or .toml)
    #[arg(long, global = true, env = "UPSHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database; overrides `database_path` from the config
    #[arg(long, global = true, env = "UPSHIFT_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the schema version and whether an upgrade is needed
    Status,
    /// Upgrade the store and wait for the result
    Upgrade,
    /// Upgrade a freshly restored store before anything else opens it
    Restore {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone().or_else(default_config_path).as_deref())?;
    let database = cli
        .database
        .clone()
        .or_else(|| config.database_path.clone())
        .or_else(default_database_path)
        .context("no --database given and no data directory available")?;

    let current = read_version(&database)?;
    banner::print_banner(&database, current, CURRENT_VERSION);

    match cli.command {
        Command::Status => {
            status(current);
            Ok(())
        }
        Command::Upgrade => run_upgrade(&config, &database, Requestor::User),
        Command::Restore { yes } => {
            if !yes && !prompt::confirm_restore(&database)? {
                println!("  Restore upgrade cancelled.");
                return Ok(());
            }
            run_upgrade(&config, &database, Requestor::Restore)
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("upshift").join("config.yml"))
}

fn default_database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("upshift").join("upshift.db"))
}

fn load_config(path: Option<&Path>) -> Result<UpgradeConfig> {
    match path {
        Some(path) => ConfigLoader::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(UpgradeConfig::default()),
    }
}

/// Schema version of the store at `path`, or 0 if it does not exist yet.
fn read_version(path: &Path) -> Result<u32> {
    if !path.exists() {
        return Ok(0);
    }
    let mut store = SqliteStore::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    store
        .schema_version()
        .context("failed to read schema version")
}

fn status(current: u32) {
    if current == CURRENT_VERSION {
        println!("  Store is up to date.");
    } else if current > CURRENT_VERSION {
        println!(
            "  Store is at version {current}, newer than this build supports ({CURRENT_VERSION})."
        );
    } else {
        println!("  Upgrade needed: version {current} -> {CURRENT_VERSION}.");
        println!("  Run `upshift upgrade` to apply it.");
    }
}

fn run_upgrade(config: &UpgradeConfig, database: &Path, requestor: Requestor) -> Result<()> {
    if let Some(parent) = database.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let registry = steps::registry().context("failed to build the upgrade step chain")?;
    let coordinator = UpgradeCoordinator::builder(
        Arc::new(SqliteOpener::new(database)),
        Arc::new(registry),
        CURRENT_VERSION,
    )
    .with_credentials(Arc::new(KeyringCredentialStore::new(KEYRING_SERVICE)))
    .build(config);
    coordinator
        .start()
        .context("failed to start the upgrade coordinator")?;

    let outcome = match coordinator.trigger(requestor) {
        TriggerResult::Started(ticket) => ticket
            .wait_blocking()
            .context("upgrade worker did not report back")?,
        TriggerResult::Completed(outcome) => outcome,
        TriggerResult::Skipped(reason) => bail!("upgrade not started: {reason}"),
    };
    coordinator.shutdown();

    println!();
    println!("  {}", outcome.summary());
    match outcome.failure {
        Some(failure) => Err(failure.into()),
        None => {
            info!(database = %database.display(), "store is at version {}", outcome.reached_version);
            Ok(())
        }
    }
}
