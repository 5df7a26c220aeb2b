//! keyward launcher
//!
//! Validates the license for this machine, then keeps the host session alive
//! while the authority keeps attesting it. Revocation ends the process.
//!
//! Usage:
//!   keyward --api-token <token>
//!   keyward --config keyward.json --verbose
//!
//! Settings layer as config file, then environment, then flags.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use keyward_launcher::ConsolePrompt;
use keyward_license::{
    DeviceInfo, HttpAuthority, LicenseError, StartupOutcome, TrustConfig, TrustScheduler,
    days_until,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{BufReader, stdin, stdout};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "keyward")]
#[command(about = "Run a keyward session gated on license validation")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validation endpoint URL [overrides KEYWARD_ENDPOINT]
    #[arg(long)]
    endpoint: Option<String>,

    /// Bearer token for the validation endpoint [overrides KEYWARD_API_TOKEN]
    #[arg(long)]
    api_token: Option<String>,

    /// Trust store location
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Seconds between revalidations
    #[arg(long)]
    interval: Option<u64>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> Result<TrustConfig> {
        let mut config = match &self.config {
            Some(path) => TrustConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TrustConfig::default(),
        }
        .apply_env();
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(token) = self.api_token {
            config.api_token = token;
        }
        if let Some(path) = self.cache_path {
            config.cache_path = Some(path);
        }
        if let Some(secs) = self.interval {
            config.revalidation_interval_secs = secs;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let device = DeviceInfo::collect();
    info!(os = %device.os_name, version = %device.os_version, host = %device.hostname, "keyward starting");

    let config = args.into_config()?;
    let authority = Arc::new(HttpAuthority::new(&config).context("building validation client")?);
    let mut scheduler = TrustScheduler::new(&config, authority);
    debug!(store = %scheduler.store().path().display(), "Trust store");

    println!("=== License Validation ===");
    println!("Machine ID: {}\n", scheduler.machine_id());

    let mut prompt = ConsolePrompt::new(BufReader::new(stdin()), stdout());
    let result = match scheduler.establish(&mut prompt).await {
        Ok(StartupOutcome::Trusted(result)) => result,
        Ok(StartupOutcome::Aborted) => {
            println!("License validation cancelled.");
            return Ok(());
        }
        Err(LicenseError::SecurityViolation) => {
            eprintln!("Application cannot run in this environment.");
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("license startup failed"),
    };

    println!("\n=== Application Started ===");
    if let Some(expiry) = result.expires_at_utc() {
        println!(
            "Licensed until {} ({} days left)",
            expiry.format("%Y-%m-%d"),
            days_until(expiry, Utc::now())
        );
    }
    println!("Press Ctrl+C to quit.\n");

    scheduler.start().context("starting periodic validation")?;
    let handle = scheduler.handle();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            _ = tick.tick() => {
                if !handle.is_trusted() {
                    warn!("License trust lost");
                    break;
                }
            }
        }
    }

    scheduler.stop().await;
    println!("Application shutting down...");
    Ok(())
}
