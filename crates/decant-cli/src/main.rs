use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use decant_sync::SyncConfig;
use decant_web::AppState;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "decant")]
#[command(about = "Decant listing tracker command-line interface")]
struct Cli {
    /// YAML config file; falls back to DECANT_CONFIG, then ./decant.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest new posts, run the daily cleanup, and serve the read endpoint.
    Run,
    /// Revalidate every stored post once and exit.
    Cleanup,
    /// Rewrite the lowest-price view from the current store.
    Rebuild,
    /// Serve the read endpoint only.
    Serve,
    /// Show which catalog entry a free-text name resolves to.
    Match { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let mut config = SyncConfig::from_yaml_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok());
            config
        }
        None => SyncConfig::from_env()?,
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await?,
        Commands::Cleanup => {
            let summary = decant_sync::run_cleanup_once(config).await?;
            println!(
                "cleanup complete: checked={} removed_sold={} removed_missing={} kept={} transient_errors={}",
                summary.checked,
                summary.removed_sold,
                summary.removed_missing,
                summary.kept,
                summary.transient_errors
            );
        }
        Commands::Rebuild => {
            let rows = decant_sync::rebuild_view_once(config).await?;
            println!("lowest prices view rebuilt: rows={rows}");
        }
        Commands::Serve => {
            let (_stop, shutdown) = shutdown_on_ctrl_c();
            decant_web::serve(web_state(&config), config.web_port, shutdown).await?;
        }
        Commands::Match { name } => {
            let catalog = decant_adapters::load_reference_catalog(&config.catalog_path)?;
            match decant_sync::best_match(&name, catalog.names()) {
                Some(m) => println!("{} (score {})", m.candidate, m.score),
                None => println!("no candidates"),
            }
        }
    }

    Ok(())
}

async fn run(config: SyncConfig) -> Result<()> {
    let (stop, shutdown) = shutdown_on_ctrl_c();

    let web = tokio::spawn(decant_web::serve(
        web_state(&config),
        config.web_port,
        shutdown.clone(),
    ));

    let result = decant_sync::run_service(config, shutdown).await;
    if let Err(err) = &result {
        error!(error = %err, "service stopped with error");
    }

    // Ingestion can also end on a startup error; the web server must follow.
    stop.send_replace(true);
    match web.await {
        Ok(Err(err)) => error!(error = %err, "read endpoint failed"),
        Err(err) => error!(error = %err, "read endpoint task panicked"),
        Ok(Ok(())) => {}
    }

    result
}

fn web_state(config: &SyncConfig) -> AppState {
    AppState::new(&config.listings_path, &config.lowest_prices_path)
}

fn shutdown_on_ctrl_c() -> (Arc<watch::Sender<bool>>, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let signal_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_tx.send_replace(true);
        }
    });
    (tx, rx)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
