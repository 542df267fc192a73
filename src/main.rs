//! wolfstore - Replicated Key-Value Store
//!
//! Command-line entry point: configuration helpers and an in-process demo
//! of a master, a frontend and a clone sharing one bus.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfstore::bus::LocalBus;
use wolfstore::config::WolfStoreConfig;
use wolfstore::data::Data;
use wolfstore::endpoint::Endpoint;
use wolfstore::error::{Error, Result};
use wolfstore::store::StoreHandle;

/// wolfstore - Replicated Key-Value Store
#[derive(Parser)]
#[command(name = "wolfstore")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfstore.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfstore.toml")]
        output: PathBuf,

        /// Endpoint name
        #[arg(long, default_value = "endpoint-1")]
        name: String,
    },

    /// Validate configuration file
    Validate,

    /// Run a master, frontend and clone in-process and show them converge
    Demo {
        /// Store name
        #[arg(long, default_value = "mystore")]
        store: String,

        /// Number of keys the master starts with
        #[arg(long, default_value_t = 3)]
        keys: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output, name } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_init(output, name)
        }
        Commands::Validate => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
            run_validate(cli.config)
        }
        Commands::Demo { store, keys } => {
            let config = load_or_default(&cli.config)?;
            let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
            init_logging(&level, &config.logging.format);
            run_demo(config, store, keys).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the config file if present, otherwise fall back to defaults
fn load_or_default(path: &Path) -> Result<WolfStoreConfig> {
    if path.exists() {
        WolfStoreConfig::from_file(path)
    } else {
        Ok(WolfStoreConfig::for_endpoint("demo"))
    }
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, name: String) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let config = WolfStoreConfig::for_endpoint(name);
    let content = format!(
        "# wolfstore Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfStoreConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Endpoint: {}", config.endpoint.name);
            println!("  Query Timeout: {:?}", config.query_timeout());
            println!("  Resync Interval: {:?}", config.resync_interval());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Run the in-process demo
async fn run_demo(config: WolfStoreConfig, store: String, keys: u64) -> Result<()> {
    let bus = LocalBus::new();

    let mut server_config = config.clone();
    server_config.endpoint.name = format!("{}-server", config.endpoint.name);
    let mut client_config = config.clone();
    client_config.endpoint.name = format!("{}-client", config.endpoint.name);

    let server = Endpoint::new(&server_config, Arc::new(bus.clone()));
    let client = Endpoint::new(&client_config, Arc::new(bus));

    let master = server.master(&store)?;
    for i in 1..=keys {
        master.insert(Data::Count(i), Data::from(format!("value-{}", i))).await;
    }

    let frontend = client.frontend(&store);
    let clone = client.clone_store(&store);

    frontend.insert("from-frontend".into(), true.into()).await;
    clone.insert("from-clone".into(), true.into()).await;
    master.erase(Data::Count(1)).await;

    // Writes are unacknowledged: wait until the master has seen both
    let deadline = Instant::now() + config.query_timeout();
    while !(master.exists(&"from-frontend".into()).await && master.exists(&"from-clone".into()).await) {
        if Instant::now() > deadline {
            tracing::warn!("Forwarded writes not yet visible on the master");
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // One resync interval bounds the clone's staleness
    tokio::time::sleep(config.resync_interval() * 2).await;

    print_contents("master", &master).await;
    print_contents("frontend", &frontend).await;
    print_contents("clone", &clone).await;

    let converged = master.contents().await == clone.contents().await;
    println!();
    println!(
        "Clone state: {:?}, sequence {} of {}, converged: {}",
        clone.state().await,
        clone.last_sequence().await,
        master.sequence().await,
        converged
    );

    Ok(())
}

async fn print_contents(label: &str, store: &dyn StoreHandle) {
    println!("{} ({} keys):", label, store.size().await);
    for (key, value) in store.contents().await {
        println!("  {} -> {}", key, value);
    }
}
