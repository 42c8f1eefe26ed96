use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use swimdesk_billing::config::BillingConfig;
use swimdesk_billing::server::BillingServer;
use swimdesk_common::logging::{self, LogFormat};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "swimdesk-billing")]
#[command(about = "SwimDesk Billing Service - invoices, payments and pay-ahead")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Generate sample configuration file")]
    gen_config: bool,

    #[arg(long, help = "Dry run mode (validate config without starting)")]
    dry_run: bool,

    #[arg(long, help = "Emit logs as JSON lines")]
    json_logs: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    logging::init_logging(
        &args.verbosity,
        "swimdesk_billing=info,swimdesk_common=info,tower_http=info",
        format,
    )?;

    if args.gen_config {
        let config = BillingConfig::default();
        let toml = toml::to_string_pretty(&config)?;
        println!("{}", toml);
        return Ok(());
    }

    let config = BillingConfig::load(args.config).context("Failed to load configuration")?;

    info!("Starting SwimDesk Billing Service");
    info!("Environment: {}", config.service.environment);
    info!("Service ID: {}", config.service.service_id);

    let server = BillingServer::new_with_config(config.clone()).await?;

    if args.dry_run {
        info!("Configuration validated successfully (dry-run mode)");
        return Ok(());
    }

    server.run_migrations().await?;

    info!(
        "Starting HTTP server on {}:{}",
        config.http.listen_address, config.http.port
    );

    if let Err(e) = server.serve(shutdown_signal()).await {
        error!("Server error: {}", e);
        return Err(e);
    }

    info!("SwimDesk Billing Service stopped gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
