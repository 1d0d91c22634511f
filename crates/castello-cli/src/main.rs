//! Castello CLI - receiver session tooling
//!
//! Features:
//! - Start position normalization
//! - Load request inspection (container, candidates, key systems)
//! - License exchange against a live license server
//! - One-shot multiplay entitlement check

use castello_core::ReceiverConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::KeySystemArg;
use output::OutputFormat;

/// Castello CLI - receiver load and DRM tooling
#[derive(Parser)]
#[command(name = "castello")]
#[command(version)]
#[command(about = "Inspect load requests and exercise license and entitlement services", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Output format (text, json, table)
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Receiver configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a requested start position
    Seek {
        /// Requested position, seconds or milliseconds
        raw: f64,

        /// Media duration in seconds (0 = unknown)
        #[arg(short, long, default_value = "0")]
        duration: f64,

        /// Restart from the beginning
        #[arg(long)]
        watch_from_start: bool,
    },

    /// Show the source a LOAD request resolves to
    Describe {
        /// Path to the LOAD request JSON (`-` for stdin)
        request: PathBuf,
    },

    /// Run a license exchange for a LOAD request
    License {
        /// Path to the LOAD request JSON (`-` for stdin)
        request: PathBuf,

        /// File holding the key message produced by the CDM
        #[arg(short, long)]
        key_message: PathBuf,

        /// Key system
        #[arg(short, long, value_enum, default_value = "widevine")]
        system: KeySystemArg,

        /// Write the license to a file instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a single multiplay entitlement check
    Entitlement {
        /// Entitlement token
        token: String,

        /// Entitlement endpoint (defaults to the configured one)
        #[arg(short, long)]
        url: Option<url::Url>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    castello_core::init();

    let config = match &cli.config {
        Some(path) => ReceiverConfig::from_json_file(path)?,
        None => ReceiverConfig::default(),
    };

    match cli.command {
        Commands::Seek { raw, duration, watch_from_start } => {
            commands::seek(raw, duration, watch_from_start, cli.format)?;
        }
        Commands::Describe { request } => {
            commands::describe(&request, &config, cli.format)?;
        }
        Commands::License { request, key_message, system, output } => {
            commands::license(&request, &key_message, system.into(), output, &config, cli.format).await?;
        }
        Commands::Entitlement { token, url } => {
            commands::entitlement(&token, url, &config, cli.format).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_system_parsed_as_value_enum() {
        let cli = Cli::try_parse_from(["castello", "license", "load.json", "-k", "challenge.bin", "-s", "playready"]).unwrap();
        match cli.command {
            Commands::License { system, .. } => assert_eq!(system, KeySystemArg::PlayReady),
            _ => panic!("expected the license command"),
        }

        let cli = Cli::try_parse_from(["castello", "license", "load.json", "-k", "challenge.bin"]).unwrap();
        assert!(matches!(cli.command, Commands::License { system: KeySystemArg::Widevine, .. }));

        assert!(Cli::try_parse_from(["castello", "license", "load.json", "-k", "challenge.bin", "-s", "fairplay"]).is_err());
    }
}
