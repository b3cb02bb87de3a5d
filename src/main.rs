use anyhow::Context;
use clap::{Parser, Subcommand};
use peerguard::{config, guard::Guard, metrics, scheduler, Config};
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EMBEDDED_CONFIG: &str = include_str!("../config.toml");

#[derive(Parser)]
#[command(author, version, about = "peerguard: peer trust and network health engine for bootstrap nodes")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Only log warnings and errors (RUST_LOG still wins when set)
    #[arg(long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the health and security cycles until Ctrl+C (default)
    Run,
    /// Load and validate the configuration, then exit
    CheckConfig,
    /// Print the built-in default configuration as TOML
    DefaultConfig,
}

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Read the config from the CLI path. A missing file at the default path falls
/// back to the embedded defaults; anything else that fails is fatal.
fn load_config(path: &str) -> anyhow::Result<Config> {
    if Path::new(path).exists() {
        return config::load(path);
    }
    if path != "config.toml" {
        anyhow::bail!("config file {} does not exist", path);
    }
    warn!(path, "config file not found, using embedded defaults");
    config::load_from_str(EMBEDDED_CONFIG).context("embedded default config is invalid")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    if let Some(Cmd::DefaultConfig) = cli.cmd {
        print!("{}", toml::to_string_pretty(&Config::default())?);
        return Ok(());
    }

    let cfg = load_config(&cli.config)?;
    if let Some(Cmd::CheckConfig) = cli.cmd {
        println!("✅ configuration OK ({})", cli.config);
        return Ok(());
    }

    let mut guard = Guard::new(&cfg);
    if cfg.metrics.enabled {
        let m = metrics::Metrics::new()?;
        metrics::serve(cfg.metrics.clone(), m.clone())?;
        guard = guard.with_metrics(m);
    }
    let guard = guard.into_handle();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let handles = scheduler::spawn(guard, &cfg.schedule, &shutdown_tx);

    info!(
        max_peers = cfg.pool.max_peers,
        max_outbound = cfg.pool.max_outbound_peers,
        max_inbound = cfg.pool.max_inbound_peers,
        min_trust = cfg.security.minimum_trust_score,
        rate_limit = cfg.dos_protection.rate_limit_requests_per_second,
        "🛡️  peerguard is running, press Ctrl+C to stop"
    );
    if cfg.metrics.enabled {
        info!("📊 metrics available on http://{}", cfg.metrics.bind);
    }

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("🛑 shutdown signal received, stopping cycles...");
            let _ = shutdown_tx.send(());
            for handle in handles {
                match tokio::time::timeout(Duration::from_secs(3), handle).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "cycle task ended abnormally"),
                    Err(_) => warn!("cycle task did not stop within 3s"),
                }
            }
            info!("👋 peerguard stopped");
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "error waiting for shutdown signal");
            Err(err.into())
        }
    }
}
