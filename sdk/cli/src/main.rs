mod export;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use export::render;
use reqwest::blocking::Client;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Format {
    Json,
    Csv,
}

#[derive(Parser, Debug)]
#[command(name = "roboid-cli")]
#[command(about = "Read-only exports from a RoboID node", long_about = None)]
struct Cli {
    /// Node base URL (e.g., http://localhost:7700)
    #[arg(long, env = "ROBOID_NODE", default_value = "http://localhost:7700")]
    node: String,

    #[arg(long, value_enum, default_value = "json")]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ledger records of one identity
    Ledger {
        did: String,
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },
    /// Audit one identity's hash chain
    Verify { did: String },
    /// Reputation of every identity, or one with its history
    Reputation { did: Option<String> },
    /// All batches, oldest first
    Batches,
    /// One batch
    Batch { id: String },
    /// Ledger and proof engine statistics
    Stats,
}

fn get(client: &Client, base: &str, path: &str) -> anyhow::Result<Value> {
    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let res = client
        .get(&url)
        .send()
        .with_context(|| format!("requesting {url}"))?;
    let status = res.status();
    let body: Value = res.json().with_context(|| format!("decoding response from {url}"))?;
    if !status.is_success() {
        anyhow::bail!("{status}: {}", body["error"].as_str().unwrap_or("request failed"));
    }
    Ok(body)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base = cli.node.as_str();

    let value = match cli.command {
        Commands::Ledger { did, from, to } => {
            let mut query = Vec::new();
            if let Some(from) = from {
                query.push(format!("from={from}"));
            }
            if let Some(to) = to {
                query.push(format!("to={to}"));
            }
            let suffix = if query.is_empty() {
                String::new()
            } else {
                format!("?{}", query.join("&"))
            };
            get(&client, base, &format!("/ledger/{did}{suffix}"))?
        }
        Commands::Verify { did } => get(&client, base, &format!("/ledger/{did}/verify"))?,
        Commands::Reputation { did: Some(did) } => {
            get(&client, base, &format!("/reputation/{did}"))?
        }
        Commands::Reputation { did: None } => get(&client, base, "/reputation")?,
        Commands::Batches => get(&client, base, "/batches")?,
        Commands::Batch { id } => get(&client, base, &format!("/batches/{id}"))?,
        Commands::Stats => json!({
            "ledger": get(&client, base, "/ledger/stats")?,
            "proofs": get(&client, base, "/proofs/stats")?,
        }),
    };

    println!("{}", render(&value, cli.format)?);
    Ok(())
}
