//! IPCom monitor — entry point.
//!
//! ```text
//! ipcom-monitor                          Monitor the configured controller
//! ipcom-monitor --host 10.0.0.5          Override the controller address
//! ipcom-monitor --command 1/2/on         Send a command after connecting
//! ipcom-monitor --config <path>          Load a custom config TOML
//! ipcom-monitor --gen-config             Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ipcom_monitor::command::CommandSpec;
use ipcom_monitor::config::MonitorConfig;
use ipcom_monitor::service::MonitorService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ipcom-monitor", about = "Live monitor for IPCom controllers")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "ipcom-monitor.toml")]
    config: PathBuf,

    /// Controller host, overriding the config file.
    #[arg(long)]
    host: Option<String>,

    /// Controller port, overriding the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Login user name, overriding the config file.
    #[arg(long)]
    username: Option<String>,

    /// Command to send once connected, as module/output/operation.
    /// May be repeated.
    #[arg(long = "command", value_name = "M/O/OP")]
    commands: Vec<CommandSpec>,

    /// Do not reconnect after the connection is lost.
    #[arg(long)]
    no_reconnect: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", MonitorConfig::default_toml()?);
        return Ok(());
    }

    // Load config, then apply CLI overrides.
    let mut config = MonitorConfig::load(&cli.config);
    if let Some(host) = cli.host {
        config.engine.controller.host = host;
    }
    if let Some(port) = cli.port {
        config.engine.controller.port = port;
    }
    if cli.username.is_some() {
        config.engine.controller.username = cli.username;
    }
    if cli.no_reconnect {
        config.engine.reconnect.enabled = false;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("ipcom-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("controller: {}", config.engine.controller.socket_addr());
    info!("poll interval: {} ms", config.engine.timing.poll_interval_ms);

    let service = MonitorService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run(&cli.commands).await?;

    Ok(())
}
