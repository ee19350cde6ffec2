use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const CREATE_LEDGER: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        name text PRIMARY KEY,
        applied_at timestamptz NOT NULL DEFAULT now()
    )
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    Applied(DateTime<Utc>),
    Pending,
}

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub name: String,
    pub state: MigrationState,
}

/// Applies every `*.sql` file under `migrations_root` that is not yet recorded,
/// in file-name order. Returns the names applied by this run.
pub fn apply_migrations_url(database_url: &str, migrations_root: &Path) -> Result<Vec<String>> {
    let migrations = list_migrations(migrations_root)?;
    if migrations.is_empty() {
        return Ok(Vec::new());
    }

    let mut client = Client::connect(&postgres_connection_string(database_url), NoTls)
        .context("Failed to connect for migrations")?;
    client
        .batch_execute(CREATE_LEDGER)
        .context("Failed to create schema_migrations")?;
    let applied = applied_migrations(&mut client)?;

    let mut newly_applied = Vec::new();
    for migration in pending(&migrations, &applied)? {
        let name = migration_name(migration)?;
        let sql = fs::read_to_string(migration)
            .with_context(|| format!("Failed to read migration {}", migration.display()))?;

        let mut transaction = client
            .transaction()
            .with_context(|| format!("Failed to start transaction for {name}"))?;
        if !sql.trim().is_empty() {
            transaction
                .batch_execute(&sql)
                .with_context(|| format!("Migration failed: {name}"))?;
        }
        transaction
            .execute("INSERT INTO schema_migrations (name) VALUES ($1)", &[&name])
            .with_context(|| format!("Failed to record migration {name}"))?;
        transaction
            .commit()
            .with_context(|| format!("Failed to commit migration transaction for {name}"))?;
        newly_applied.push(name);
    }

    Ok(newly_applied)
}

pub fn migration_status(database_url: &str, migrations_root: &Path) -> Result<Vec<MigrationStatus>> {
    let migrations = list_migrations(migrations_root)?;
    let mut client = Client::connect(&postgres_connection_string(database_url), NoTls)
        .context("Failed to connect for migrations")?;
    client
        .batch_execute(CREATE_LEDGER)
        .context("Failed to create schema_migrations")?;
    let applied = applied_migrations(&mut client)?;

    migrations
        .iter()
        .map(|path| {
            let name = migration_name(path)?;
            let state = match applied.get(&name) {
                Some(at) => MigrationState::Applied(*at),
                None => MigrationState::Pending,
            };
            Ok(MigrationStatus { name, state })
        })
        .collect()
}

pub fn list_migrations(migrations_root: &Path) -> Result<Vec<PathBuf>> {
    if !migrations_root.is_dir() {
        bail!(
            "Migrations directory missing at {}",
            migrations_root.display()
        );
    }

    let mut migrations: Vec<PathBuf> = fs::read_dir(migrations_root)
        .with_context(|| format!("Failed to read {}", migrations_root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().and_then(|v| v.to_str()) == Some("sql"))
        .collect();
    migrations.sort();
    Ok(migrations)
}

fn pending<'a>(
    migrations: &'a [PathBuf],
    applied: &BTreeMap<String, DateTime<Utc>>,
) -> Result<Vec<&'a PathBuf>> {
    let mut remaining = Vec::new();
    for path in migrations {
        if !applied.contains_key(&migration_name(path)?) {
            remaining.push(path);
        }
    }
    Ok(remaining)
}

fn applied_migrations(client: &mut Client) -> Result<BTreeMap<String, DateTime<Utc>>> {
    let rows = client
        .query("SELECT name, applied_at FROM schema_migrations", &[])
        .context("Failed to read schema_migrations")?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<_, String>(0), row.get::<_, DateTime<Utc>>(1)))
        .collect())
}

fn migration_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Migration path has no usable file name: {}", path.display()))
}

/// libpq rejects SQLAlchemy driver suffixes such as `postgresql+psycopg://`.
pub fn postgres_connection_string(database_url: &str) -> String {
    let (scheme, rest) = match database_url.split_once("://") {
        Some(parts) => parts,
        None => return database_url.to_string(),
    };
    let (base, _driver) = match scheme.split_once('+') {
        Some(parts) => parts,
        None => return database_url.to_string(),
    };
    if base != "postgresql" {
        return database_url.to_string();
    }
    format!("postgresql://{rest}")
}
