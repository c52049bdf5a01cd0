mod config;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use rekey::{Rekeyer, TablePhase};
use tokio_postgres::{Client, NoTls};

use crate::config::Config;

/// Move a Postgres schema from integer primary keys to ULIDs.
#[derive(Parser, Debug)]
#[command(name = "rekey", version)]
struct Cli {
    /// Database connection URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Command to run (defaults to `run`)
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Re-key every table and cut over
    Run,
    /// Show the migration order without touching any data
    Plan,
    /// Show the progress recorded by previous runs
    Status,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = Config::load(cli.database_url)?;
    tracing::info!(
        database = %mask_password(&config.database_url),
        schema = %config.rekey.schema,
        "connecting"
    );
    let client = connect(&config.database_url).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let report = Rekeyer::new(&client, config.rekey).run().await?;
            println!(
                "{} {} tables, {} rows re-keyed",
                "done:".green().bold(),
                report.tables.len(),
                report.rows()
            );
        }
        Commands::Plan => {
            let (schema, order) = Rekeyer::new(&client, config.rekey).plan().await?;
            println!("Migration order ({} tables):", order.tables.len());
            for (i, name) in order.tables.iter().enumerate() {
                let refs = schema
                    .get_table(name)
                    .map(|t| {
                        schema
                            .references(t)
                            .iter()
                            .map(|r| format!("{} -> {}", r.column, r.references))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                if refs.is_empty() {
                    println!("  {:>3}. {}", i + 1, name);
                } else {
                    println!("  {:>3}. {} {}", i + 1, name, format!("({})", refs.join(", ")).dimmed());
                }
            }
            if !order.deferred.is_empty() {
                println!();
                println!("Deferred references (filled in after the copy):");
                for d in &order.deferred {
                    println!("  {}.{} -> {}", d.table, d.column, d.references.yellow());
                }
            }
        }
        Commands::Status => {
            let entries = rekey::state::load(&client, &config.rekey.schema).await?;
            if entries.is_empty() {
                println!("No run recorded in schema '{}'.", config.rekey.schema);
                return Ok(());
            }
            for entry in &entries {
                let phase = match entry.phase {
                    TablePhase::Pending => entry.phase.as_str().yellow().to_string(),
                    TablePhase::Shadowed => entry.phase.as_str().cyan().to_string(),
                    TablePhase::Cutover => entry.phase.as_str().green().to_string(),
                };
                let rows = entry
                    .rows
                    .map(|n| format!("{} rows", n))
                    .unwrap_or_default();
                println!(
                    "  {:<32} {:<10} {:>14}  {}",
                    entry.table,
                    phase,
                    rows,
                    entry.updated_at.format("%Y-%m-%d %H:%M:%S").dimmed()
                );
            }
        }
    }

    Ok(())
}

async fn connect(url: &str) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("connection error: {}", e);
        }
    });
    Ok(client)
}

/// Mask password in database URL for display
fn mask_password(url: &str) -> String {
    let Some(start) = url.find("://") else {
        return url.to_string();
    };
    let Some(at) = url.rfind('@').filter(|&at| at > start) else {
        return url.to_string();
    };
    match url[start + 3..at].find(':') {
        Some(colon) => format!("{}:***{}", &url[..start + 3 + colon], &url[at..]),
        None => url.to_string(),
    }
}
