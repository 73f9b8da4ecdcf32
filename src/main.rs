use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use yakyak_auth::application::AuthenticationEngine;
use yakyak_auth::config::{Config, AUTHENTICATION_OPTIONS};
use yakyak_auth::infrastructure::metrics::describe_metrics;
use yakyak_auth::infrastructure::persistence::backend_from_config;
use yakyak_auth::infrastructure::protocols::sip::TransactionLayer;

/// Transactions older than this are forgotten (64 * T1)
const TRANSACTION_LIFETIME_SECS: i64 = 32;

fn print_usage() {
    println!("Usage: yakyak-auth [--dump-default | --list-options] [CONFIG_FILE]");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dump-default" => {
                print!("{}", Config::default().to_toml()?);
                return Ok(());
            }
            "--list-options" => {
                for option in AUTHENTICATION_OPTIONS {
                    let deprecated = if option.deprecated { " (deprecated)" } else { "" };
                    println!(
                        "authentication.{} [{:?}, default '{}']{}\n    {}",
                        option.name, option.kind, option.default, deprecated, option.description
                    );
                }
                return Ok(());
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            path => config_path = Some(PathBuf::from(path)),
        }
    }

    // Load configuration
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.global.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting YakYak authentication module");
    describe_metrics();

    let backend = backend_from_config(&config.authentication)?;
    let transactions = Arc::new(TransactionLayer::new());
    let engine = Arc::new(AuthenticationEngine::new(
        &config,
        backend,
        Arc::clone(&transactions),
    )?);

    let idle = engine.spawn_idle_task(Duration::from_secs(config.global.idle_interval));

    let sweeper = {
        let transactions = Arc::clone(&transactions);
        let period = Duration::from_secs(TRANSACTION_LIFETIME_SECS as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now() - chrono::Duration::seconds(TRANSACTION_LIFETIME_SECS);
                transactions.cleanup_older_than(cutoff).await;
            }
        })
    };

    info!("Authentication module ready, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    idle.abort();
    sweeper.abort();

    match serde_json::to_string(&engine.stats()) {
        Ok(stats) => info!("Final statistics: {}", stats),
        Err(e) => warn!("Could not serialize statistics: {}", e),
    }
    info!("Shutting down");
    Ok(())
}
