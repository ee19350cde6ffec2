mod cli;
mod migrations;

use anyhow::{bail, Result};
use clap::Parser;
use std::env;

use crate::cli::{Cli, Commands, MigrateArgs};
use crate::migrations::MigrationState;

fn resolve_database_url(args: &MigrateArgs) -> Result<String> {
    if let Some(url) = args.database_url.as_deref().map(str::trim) {
        if !url.is_empty() {
            return Ok(url.to_string());
        }
    }
    dotenvy::dotenv().ok();
    let url = env::var("INGEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .unwrap_or_default();
    if url.trim().is_empty() {
        bail!("No database URL: pass --database-url or set INGEST_DATABASE_URL/DATABASE_URL");
    }
    Ok(url.trim().to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Apply(args) => {
            let database_url = resolve_database_url(&args)?;
            let applied = migrations::apply_migrations_url(&database_url, &args.dir)?;
            if applied.is_empty() {
                println!("Schema is up to date");
            }
            for name in applied {
                println!("applied  {name}");
            }
        }
        Commands::Status(args) => {
            let database_url = resolve_database_url(&args)?;
            for migration in migrations::migration_status(&database_url, &args.dir)? {
                match migration.state {
                    MigrationState::Applied(at) => {
                        println!("applied  {}  {}", migration.name, at.to_rfc3339())
                    }
                    MigrationState::Pending => println!("pending  {}", migration.name),
                }
            }
        }
    }
    Ok(())
}
