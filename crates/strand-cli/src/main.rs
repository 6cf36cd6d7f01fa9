//! CLI entry point for the Strand graph engine.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::{fmt, EnvFilter};

use strand_core::config::StrandConfig;
use strand_graph::{GraphClient, Passport};

use strand_cli::commands;
use strand_cli::persist::{load_storage, save_storage};

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Schema-driven graph database over a JSON snapshot")]
struct Cli {
    /// Config file prefix (default: strand).
    #[arg(short, long, default_value = "strand")]
    config: String,

    /// Token UID used to stamp the passport (overrides config).
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Produce the stored value for a hash prop.
    Sign {
        /// Base64 32-byte ed25519 seed.
        #[arg(long)]
        secret: String,
        plaintext: String,
    },
    #[command(flatten)]
    Graph(GraphCommand),
}

/// Commands that run against the snapshot through a passport.
#[derive(Subcommand)]
enum GraphCommand {
    /// Show or extend the schema.
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
    /// Apply a mutation request file.
    Mutate { file: PathBuf },
    /// Run a query request file.
    Query { file: PathBuf },
    /// Delete nodes and their relationships.
    Delete {
        #[arg(required = true)]
        uids: Vec<String>,
    },
    /// Delete the schema and all data.
    DeleteAll,
}

#[derive(Subcommand)]
enum SchemaAction {
    Show,
    Add { file: PathBuf },
}

impl GraphCommand {
    fn writes(&self) -> bool {
        matches!(
            self,
            Self::Schema {
                action: SchemaAction::Add { .. }
            } | Self::Mutate { .. }
                | Self::Delete { .. }
                | Self::DeleteAll
        )
    }

    async fn run(&self, passport: &mut Passport, config: &StrandConfig) -> anyhow::Result<Value> {
        let output = match self {
            Self::Schema { action } => match action {
                SchemaAction::Show => commands::show_schema(passport)?,
                SchemaAction::Add { file } => {
                    let addition = commands::read_request(file)?;
                    commands::add_schema(passport, addition).await?
                }
            },
            Self::Mutate { file } => {
                let request = commands::read_request(file)?;
                commands::mutate(passport, &request).await?
            }
            Self::Query { file } => {
                let request = commands::read_request(file)?;
                commands::query(passport, request, &config.public_keys).await?
            }
            Self::Delete { uids } => commands::delete(passport, uids).await?,
            Self::DeleteAll => commands::delete_all(passport).await?,
        };
        Ok(output)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = StrandConfig::load(&cli.config)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        fmt().with_env_filter(filter).json().with_writer(std::io::stderr).init();
    } else {
        fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    }

    let output = match &cli.command {
        Command::Sign { secret, plaintext } => commands::sign(secret, plaintext)?,
        Command::Graph(command) => {
            let snapshot = PathBuf::from(&config.snapshot_path);
            let storage = Arc::new(load_storage(&snapshot)?);
            let client = GraphClient::new(storage.clone());
            let token = cli.token.clone().or_else(|| config.token.clone());
            let mut passport = client.passport(token).await?;

            let output = command.run(&mut passport, &config).await?;
            if command.writes() {
                save_storage(&snapshot, &storage).await?;
            }
            output
        }
    };
    print(&output)
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
