//! squirreldb-cli - Command-line interface for SquirrelDB
//!
//! One-shot commands over the binary wire protocol.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use squirreldb_client::{Client, ConnectionConfig, EncodingPreference};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "squirreldb-cli")]
#[command(about = "Command-line interface for the SquirrelDB document database")]
#[command(version)]
struct Cli {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8082")]
    server: SocketAddr,

    /// Authentication token sent in the handshake
    #[arg(short = 't', long, env = "SQUIRRELDB_TOKEN")]
    token: Option<String>,

    /// Only offer JSON payloads (no MessagePack)
    #[arg(long)]
    json: bool,

    /// Connect timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Per-request timeout in seconds (waits forever if unset)
    #[arg(long)]
    request_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping the server
    Ping,

    /// Run a query and print the result
    Query {
        /// Query string, passed to the server unchanged
        query: String,
    },

    /// Insert a document
    Insert {
        /// Collection name
        #[arg(short, long)]
        collection: String,

        /// Document JSON (or @file.json to read from file)
        data: String,
    },

    /// Replace a document's data
    Update {
        /// Collection name
        #[arg(short, long)]
        collection: String,

        /// Document ID
        #[arg(short, long)]
        id: String,

        /// Document JSON (or @file.json to read from file)
        data: String,
    },

    /// Delete a document
    Delete {
        /// Collection name
        #[arg(short, long)]
        collection: String,

        /// Document ID
        #[arg(short, long)]
        id: String,
    },

    /// List collections
    Collections,

    /// Stream changes for a query until Ctrl+C
    Subscribe {
        /// Query string, passed to the server unchanged
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = ConnectionConfig::new(cli.server)
        .with_connect_timeout(Duration::from_secs(cli.connect_timeout));
    if let Some(ref token) = cli.token {
        config = config.with_auth_token(token);
    }
    if let Some(secs) = cli.request_timeout {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    if cli.json {
        config = config.with_encoding(EncodingPreference::JsonOnly);
    }

    let client = Client::connect(config).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::debug!(
        "Connected (session {}, encoding {})",
        client.session_id(),
        client.encoding()
    );

    match cli.command {
        Commands::Subscribe { query } => {
            let mut subscription = match client.subscribe_stream(query.as_str()).await {
                Ok(subscription) => subscription,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            };

            eprintln!(
                "{} {} (sub_id: {})",
                "Subscribed to".green(),
                query.cyan(),
                subscription.id()
            );
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            loop {
                tokio::select! {
                    change = subscription.next() => {
                        match change {
                            Some(change) => println!("{}", commands::format_change(&change)),
                            None => {
                                eprintln!("{}", "Connection closed".red());
                                break;
                            }
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping subscription...".dimmed());
                        let _ = client.unsubscribe(subscription.id()).await;
                        break;
                    }
                }
            }
        }
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => println!("{}", output),
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}
