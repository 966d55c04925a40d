//! Command-line interface for the guardpost proxy.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use guardpost_core::config::ProxyConfig;

/// Guardpost - security-scanning reverse proxy for local LLM backends.
#[derive(Parser, Debug)]
#[command(name = "guardpost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Path to the YAML configuration file (falls back to $CONFIG_FILE).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server.
    Serve {
        /// Host to bind to (overrides configuration).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to (overrides configuration).
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then print the effective values.
    CheckConfig,
    /// Run one text through the input scanners and print the verdict.
    Scan {
        /// The text to scan.
        text: String,
        /// Scan with the output pipeline instead of the input pipeline.
        #[arg(long)]
        output: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("CONFIG_FILE").ok().map(PathBuf::from));
    let config = ProxyConfig::load(config_path.as_deref())?;

    match args.command {
        Command::Serve { host, port } => {
            let mut config = config;
            if let Some(host) = host {
                config.proxy_host = host;
            }
            if let Some(port) = port {
                config.proxy_port = port;
            }
            guardpost_proxy::run(config).await
        }
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Scan { text, output } => {
            let engine = guardpost_scanners::GuardEngine::from_config(&config);
            let verdict = if output {
                engine.scan_output("", &text).await
            } else {
                engine.scan_input(&text).await
            };
            println!("{}", serde_json::to_string_pretty(&verdict)?);
            if !verdict.allowed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
