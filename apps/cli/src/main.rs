mod console;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mdb_core::{
    BridgeConfig, Client, FakeBridge, LogObserver, MdbConfig, MdbSession, UartDriver,
};
use tracing::{error, info};

use console::{Console, HELP};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Driver {
    File,
    Helper,
    Bridge,
}

impl From<Driver> for UartDriver {
    fn from(d: Driver) -> Self {
        match d {
            Driver::File => UartDriver::File,
            Driver::Helper => UartDriver::Helper,
            Driver::Bridge => UartDriver::Bridge,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "MDB bus console", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UART driver, overrides the configuration
    #[arg(long, value_enum)]
    driver: Option<Driver>,

    /// MDB line device, overrides the configuration
    #[arg(long)]
    device: Option<String>,

    /// Helper program for the helper driver
    #[arg(long)]
    helper: Option<String>,

    /// Run against an emulated bridge that acknowledges everything
    #[arg(long)]
    offline: bool,

    /// Commands to run instead of reading stdin
    #[arg(trailing_var_arg = true)]
    script: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<MdbConfig> {
    let mut config = match &args.config {
        Some(path) => MdbConfig::load_from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => MdbConfig::default(),
    };
    if let Some(driver) = args.driver {
        config.uart_driver = driver.into();
    }
    if let Some(device) = &args.device {
        config.uart_device = device.clone();
    }
    if let Some(helper) = &args.helper {
        config.helper_path = helper.clone();
    }
    Ok(config)
}

fn open_session(args: &Args, config: MdbConfig) -> Result<MdbSession> {
    if !args.offline {
        return MdbSession::open(config);
    }
    let fake = FakeBridge::acking();
    let bridge_config = BridgeConfig {
        spi_device: "fake".into(),
        ..config.bridge.clone()
    };
    let observer = Arc::new(LogObserver);
    let client = Client::open(fake.spi(), fake.notify(), bridge_config, observer.clone())?;
    Ok(MdbSession::with_bridge(config, client, observer))
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let session = open_session(args, config)?;
    let console = Console::new(session.bus());

    if !args.script.is_empty() {
        let line = args.script.join(" ");
        let result = console.run_line(&line);
        session.close()?;
        return result;
    }

    println!("{HELP}");
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if let Err(e) = console.run_line(&line) {
            error!("{:#}", e);
        }
        stdout.flush()?;
    }
    session.close()
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    info!("Starting MDB console...");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
