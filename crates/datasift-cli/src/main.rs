//! DataSift CLI - stream interactions from the command line
//!
//! Subscribes to one or more stream hashes and prints every event the
//! client reports until interrupted.

mod config;
mod output;
mod stream;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use datasift_client::DataSiftClient;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ArgOverrides, Config};
use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "datasift-cli")]
#[command(author, version, about = "Stream interactions from DataSift")]
struct Cli {
    /// Stream hash(es) to subscribe to
    #[arg(required = true, value_name = "HASH")]
    hashes: Vec<String>,

    /// DataSift username
    #[arg(short, long, env = "DATASIFT_USERNAME")]
    username: Option<String>,

    /// DataSift API key
    #[arg(short = 'k', long, env = "DATASIFT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Stream host
    #[arg(long)]
    host: Option<String>,

    /// Stream port
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long, env = "DATASIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    output: Option<OutputFormat>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load config file
    let config = if let Some(config_path) = &cli.config {
        Config::load_from(config_path)?
    } else {
        Config::load().unwrap_or_default()
    };

    // Merge CLI args with config
    let merged = config.merge_with_args(&ArgOverrides {
        username: cli.username.as_deref(),
        api_key: cli.api_key.as_deref(),
        host: cli.host.as_deref(),
        port: cli.port,
        output: cli.output.map(OutputFormat::as_str),
        no_color: cli.no_color,
    });

    let format = OutputFormat::from_str(&merged.output, true)
        .map_err(|e| anyhow!("Invalid output format in config: {e}"))?;
    let ctx = OutputContext::new(format, merged.no_color, cli.quiet);

    tracing::debug!(host = %merged.host, port = merged.port, "Using stream endpoint");
    let client = DataSiftClient::with_config(merged.client_config())
        .context("Failed to create DataSift client")?;

    stream::stream(&client, &cli.hashes, &ctx).await
}
