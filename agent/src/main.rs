//! Neodip agent - headless entry point
//!
//! Exit codes: 0 on a clean shutdown; 2 for unrecoverable configuration or
//! persistence problems; 1 for anything else fatal. A broker outage is not
//! fatal; the runtime keeps consuming schedule ticks and retries.

use anyhow::Context;
use clap::Parser;
use neodip_core::config::{AgentConfig, Credentials};
use neodip_core::errors::Error;
use neodip_core::events::LogNotifier;
use neodip_engine::Runtime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "neodip", about = "RSI-dip trading agent for NSE cash equities")]
struct Cli {
    /// Path to the agent configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Broker login mobile number
    #[arg(long, env = "NEODIP_MOBILE_NUMBER", hide_env_values = true)]
    mobile_number: String,

    /// Broker login password
    #[arg(long, env = "NEODIP_PASSWORD", hide_env_values = true)]
    password: String,

    /// Broker trade MPIN
    #[arg(long, env = "NEODIP_MPIN", hide_env_values = true)]
    mpin: String,

    /// API consumer key
    #[arg(long, env = "NEODIP_CONSUMER_KEY", hide_env_values = true)]
    consumer_key: String,

    /// Simulate order execution instead of trading the live account
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neodip_agent=info,neodip_engine=info,neodip_networking=info,neodip_persistence=info,neodip_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = match boot(cli) {
        Ok(code) => code,
        Err(e) => {
            // nothing the runtime can recover at this point
            eprintln!("FATAL: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

/// Everything that must succeed before the runtime owns error handling
fn boot(cli: Cli) -> anyhow::Result<i32> {
    let config = AgentConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    let credentials = Credentials {
        mobile_number: cli.mobile_number,
        password: cli.password,
        mpin: cli.mpin,
        consumer_key: cli.consumer_key,
    };

    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    Ok(runtime.block_on(run(config, credentials, cli.dry_run)))
}

async fn run(config: AgentConfig, credentials: Credentials, dry_run: bool) -> i32 {
    tracing::info!("Starting neodip agent");

    let notifier = Arc::new(LogNotifier::new(config.notifications.clone()));
    let agent = match Runtime::build(config, credentials, notifier, dry_run).await {
        Ok(agent) => agent,
        Err(e @ (Error::Persistence(_) | Error::Config(_))) => {
            eprintln!("FATAL: {}", e);
            return 2;
        }
        Err(e) => {
            eprintln!("FATAL: {}", e);
            return 1;
        }
    };

    let cancel = agent.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    match agent.run().await {
        Ok(()) => 0,
        Err(e @ (Error::Persistence(_) | Error::Config(_))) => {
            tracing::error!("unrecoverable: {}", e);
            2
        }
        Err(e) => {
            tracing::error!("fatal: {}", e);
            1
        }
    }
}
