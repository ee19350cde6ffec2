use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ingest-migrate",
    version,
    about = "Applies sensor-ingest schema migrations"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply every migration not yet recorded in schema_migrations.
    Apply(MigrateArgs),
    /// List migrations as applied or pending.
    Status(MigrateArgs),
}

#[derive(Args)]
pub struct MigrateArgs {
    /// Override database URL (otherwise uses INGEST_DATABASE_URL/DATABASE_URL).
    #[arg(long)]
    pub database_url: Option<String>,
    /// Directory containing SQL migration files.
    #[arg(long, default_value = "migrations")]
    pub dir: PathBuf,
}
