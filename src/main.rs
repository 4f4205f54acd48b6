use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use umbra_c2::database::Storage;
use umbra_c2::extender::Extender;
use umbra_c2::{modules, ServerConfig, Teamserver};

#[derive(Parser)]
#[command(name = "umbra_server")]
#[command(about = "UmbraC2 Teamserver - Authorized Security Testing Only")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Generate default configuration file
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Database path (overrides config)
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(path) = cli.generate_config {
        let config = ServerConfig::default();
        config.save_to_file(&path)?;
        println!("Default configuration written to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(path) = cli.config {
        ServerConfig::from_file(&path)?
    } else {
        ServerConfig::default()
    };

    if let Some(db_path) = cli.database {
        config.database_path = Some(db_path);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    umbra_c2::logging::init_logging(&config.logging);

    tracing::info!("UmbraC2 teamserver starting");

    let storage = match &config.database_path {
        Some(path) => {
            tracing::info!("Database: {}", path.display());
            Storage::sqlite(path).await?
        }
        None => {
            tracing::warn!("No database configured, running without persistence");
            Storage::null()
        }
    };

    let factories = modules::builtin_factories();
    let extender = Extender::load(
        &config.extender_configs,
        &factories,
        &config.listener_state_dir,
    );

    let teamserver = Arc::new(Teamserver::new(extender, storage));

    for startup in &config.listeners {
        let profile = match std::fs::read(&startup.profile) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(
                    listener = %startup.name,
                    profile = %startup.profile.display(),
                    "profile read failed: {}", e
                );
                continue;
            }
        };
        if let Err(e) =
            Arc::clone(&teamserver).ts_listener_start(&startup.name, &startup.registry, &profile)
        {
            tracing::error!(listener = %startup.name, "listener start failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    for startup in &config.listeners {
        if let Err(e) = teamserver.ts_listener_stop(&startup.name) {
            tracing::debug!(listener = %startup.name, "listener stop: {}", e);
        }
    }

    tracing::info!("UmbraC2 teamserver shutdown complete");
    Ok(())
}
