//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use squirreldb_client::Client;
use squirreldb_protocol::{ChangeEvent, Document};

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Query { query } => {
            let result = client.query(query).await?;
            Ok(format_json(&result))
        }

        Commands::Insert { collection, data } => {
            let data = parse_json_arg(&data)?;
            let doc = client.insert(&collection, data).await?;
            Ok(format_document("Inserted", &doc))
        }

        Commands::Update {
            collection,
            id,
            data,
        } => {
            let data = parse_json_arg(&data)?;
            let doc = client.update(&collection, &id, data).await?;
            Ok(format_document("Updated", &doc))
        }

        Commands::Delete { collection, id } => {
            let doc = client.delete(&collection, &id).await?;
            Ok(format_document("Deleted", &doc))
        }

        Commands::Collections => {
            let collections = client.list_collections().await?;
            if collections.is_empty() {
                return Ok("No collections".yellow().to_string());
            }
            Ok(collections
                .iter()
                .map(|name| format!("  {}", name.cyan()))
                .collect::<Vec<_>>()
                .join("\n"))
        }

        // Streams until interrupted, handled in main.rs
        Commands::Subscribe { .. } => unreachable!(),
    }
}

/// Formats a change event as a single JSON line.
pub fn format_change(change: &ChangeEvent) -> String {
    serde_json::to_string(change).unwrap_or_else(|e| format!("<unprintable change: {}>", e))
}

fn format_document(verb: &str, doc: &Document) -> String {
    format!(
        "{} {} in {}\n{}",
        verb.green(),
        doc.id.cyan(),
        doc.collection,
        format_json(&doc.data)
    )
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
