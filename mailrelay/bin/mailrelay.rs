//! Command-line entry point for the mail relay
//!
//! - `run` starts the delivery workers, replay sweep and backlog monitor
//! - `send` delivers one message read from stdin
//! - `replay` retries failed jobs once
//! - `keygen` creates a signing key pair and its DNS record
//! - `check-config` prints the effective configuration

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use mailrelay::{config, controller::Relay};
use mailrelay_common::logging;
use mailrelay_delivery::Disposition;
use mailrelay_dkim::{default_providers, generate_keys, keygen::DEFAULT_KEY_BITS};
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[command(name = "mailrelay")]
#[command(about = "Relay locally submitted mail to its destination", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (otherwise `MAILRELAY_CONFIG`, then the default locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay until interrupted
    Run,
    /// Deliver one message read from stdin
    Send {
        /// Envelope sender
        #[arg(long)]
        from: String,

        /// Envelope recipients
        #[arg(required = true)]
        recipients: Vec<String>,
    },
    /// Retry every failed job once
    Replay,
    /// Generate a signing key pair and DNS TXT record
    Keygen {
        #[arg(long)]
        domain: String,

        #[arg(long, default_value = "mail")]
        selector: String,

        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,

        /// Directory the `{domain}/` key directory is created in
        #[arg(long, default_value = "keys")]
        out_dir: PathBuf,
    },
    /// Print the effective configuration with passwords masked
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init();

    match cli.command {
        Commands::Run => {
            let relay = Relay::new(config::load(cli.config.as_deref())?)?;
            relay.run().await?;
        }
        Commands::Send { from, recipients } => {
            let relay = Relay::new(config::load(cli.config.as_deref())?)?;

            let mut data = Vec::new();
            tokio::io::stdin().read_to_end(&mut data).await?;

            let report = relay.send(from, recipients, data).await?;
            match report.outcome {
                Ok(Disposition::Delivered { via }) => {
                    println!("{}: delivered via {via} in {:?}", report.id, report.duration);
                }
                Ok(Disposition::Stored { via }) => {
                    println!("{}: not delivered, stored via {via}", report.id);
                }
                Err(err) => {
                    eprintln!("{}: {err}", report.id);
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Replay => {
            let relay = Relay::new(config::load(cli.config.as_deref())?)?;
            let summary = relay.replay_once().await?;
            println!(
                "Replayed {} jobs: {} delivered, {} remaining ({} unreadable)",
                summary.attempted, summary.delivered, summary.remaining, summary.unreadable
            );
        }
        Commands::Keygen {
            domain,
            selector,
            bits,
            out_dir,
        } => {
            let keys = generate_keys(&out_dir, &domain, &selector, bits, &default_providers())?;
            println!("Private key: {}", keys.private_key.display());
            println!("Public key:  {}", keys.public_key.display());
            println!("Generated with: {}", keys.provider);
            println!();
            println!("Publish this DNS record ({}):", keys.dns_record.display());
            println!("{}", keys.txt_record);
        }
        Commands::CheckConfig => {
            let config = config::load(cli.config.as_deref())?;
            println!("{}", config::render(&config)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
