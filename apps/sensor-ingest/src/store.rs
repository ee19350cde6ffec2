use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor};
use thiserror::Error;


const UPSERT_TEMPERATURE: &str = r#"
    INSERT INTO sensor_reading (device_id, timestamp, temperature)
    VALUES (get_or_create_device($1), $2, $3)
    ON CONFLICT (device_id, timestamp)
    DO UPDATE SET temperature = EXCLUDED.temperature
"#;

const UPSERT_RELATIVE_HUMIDITY: &str = r#"
    INSERT INTO sensor_reading (device_id, timestamp, relative_humidity)
    VALUES (get_or_create_device($1), $2, $3)
    ON CONFLICT (device_id, timestamp)
    DO UPDATE SET relative_humidity = EXCLUDED.relative_humidity
"#;

const CHECK_VIOLATION: &str = "23514";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to the store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("failed to prepare {statement} upsert: {source}")]
    Prepare {
        statement: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("upsert failed: {0}")]
    Execute(#[source] sqlx::Error),
    /// The row broke a check constraint, e.g. a reading whose only value
    /// column would be null.
    #[error("row rejected by check constraint: {0}")]
    Rejected(#[source] sqlx::Error),
    #[error("store connection already closed")]
    Closed,
}

impl StoreError {
    pub fn is_check_violation(&self) -> bool {
        matches!(self, StoreError::Rejected(_))
    }

    fn from_execute(err: sqlx::Error) -> Self {
        let rejected = matches!(
            &err,
            sqlx::Error::Database(db) if db.code().as_deref() == Some(CHECK_VIOLATION)
        );
        if rejected {
            StoreError::Rejected(err)
        } else {
            StoreError::Execute(err)
        }
    }
}

/// Upsert target for readings, keyed by (device, timestamp).
#[async_trait]
pub trait ReadingStore: Send {
    async fn upsert_temperature(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError>;

    async fn upsert_relative_humidity(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError>;

    /// Releases the connection. Safe to call more than once.
    async fn close(&mut self);
}

/// One dedicated Postgres connection with both upserts prepared up front.
pub struct PgReadingStore {
    conn: Option<PgConnection>,
}

impl PgReadingStore {
    pub async fn connect(options: &PgConnectOptions) -> Result<Self, StoreError> {
        let mut conn = PgConnection::connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        // Prepared statements are cached on the connection and reused by every upsert.
        for (statement, sql) in [
            ("temperature", UPSERT_TEMPERATURE),
            ("relative-humidity", UPSERT_RELATIVE_HUMIDITY),
        ] {
            if let Err(source) = conn.prepare(sql).await {
                let _ = conn.close().await;
                return Err(StoreError::Prepare { statement, source });
            }
        }
        tracing::info!("store connected; upserts prepared");
        Ok(Self { conn: Some(conn) })
    }

    async fn upsert(
        &mut self,
        sql: &'static str,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.as_mut().ok_or(StoreError::Closed)?;
        sqlx::query(sql)
            .bind(device)
            .bind(timestamp)
            .bind(value)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::from_execute)?;
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn upsert_temperature(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError> {
        self.upsert(UPSERT_TEMPERATURE, device, timestamp, value)
            .await
    }

    async fn upsert_relative_humidity(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError> {
        self.upsert(UPSERT_RELATIVE_HUMIDITY, device, timestamp, value)
            .await
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.close().await {
                tracing::warn!(error = %err, "store connection did not close cleanly");
            } else {
                tracing::info!("store connection closed");
            }
        }
    }
}
