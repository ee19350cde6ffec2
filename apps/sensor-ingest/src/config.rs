use anyhow::{Context, Result};
use dotenvy::dotenv;
use sqlx::postgres::PgConnectOptions;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// A message that fails to parse fails the receive task.
    Fail,
    /// A message that fails to parse is logged and dropped.
    Skip,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: Option<String>,
    pub db_name: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub maintenance_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub disconnect_timeout_ms: u64,
    pub malformed_policy: MalformedPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("INGEST_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(normalize_database_url);
        let db_host = env::var("INGEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let db_port = env::var("INGEST_DB_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5432);
        let db_user = env::var("INGEST_DB_USER").unwrap_or_else(|_| "postgres".to_string());
        let db_password = env::var("INGEST_DB_PASSWORD").ok();
        let db_name = env::var("INGEST_DB_NAME").unwrap_or_else(|_| "sensors".to_string());

        let mqtt_host = env::var("INGEST_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env::var("INGEST_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(1883);
        let mqtt_username = env::var("INGEST_MQTT_USERNAME").ok();
        let mqtt_password = env::var("INGEST_MQTT_PASSWORD").ok();
        let mqtt_client_id = env::var("INGEST_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("sensor-ingest-{}", std::process::id()));
        let mqtt_topic_prefix =
            env::var("INGEST_MQTT_TOPIC_PREFIX").unwrap_or_else(|_| "devices".to_string());
        let mqtt_keepalive_secs = env::var("INGEST_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let maintenance_interval_ms = env::var("INGEST_MAINTENANCE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v != 0)
            .unwrap_or(1000);
        let max_reconnect_attempts = env::var("INGEST_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let disconnect_timeout_ms = env::var("INGEST_DISCONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5000);
        let malformed_policy = match env::var("INGEST_SKIP_MALFORMED") {
            Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => MalformedPolicy::Skip,
            _ => MalformedPolicy::Fail,
        };

        Ok(Self {
            database_url,
            db_host,
            db_port,
            db_user,
            db_password,
            db_name,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_topic_prefix,
            mqtt_keepalive_secs,
            maintenance_interval_ms,
            max_reconnect_attempts,
            disconnect_timeout_ms,
            malformed_policy,
        })
    }

    /// Wildcard filter matching `<prefix>/<device>/<kind>`.
    pub fn topic_filter(&self) -> String {
        format!("{}/+/+", self.mqtt_topic_prefix.trim_end_matches('/'))
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        if let Some(url) = &self.database_url {
            return PgConnectOptions::from_str(url)
                .context("INGEST_DATABASE_URL / DATABASE_URL is not a valid postgres URL");
        }
        let mut options = PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .username(&self.db_user)
            .database(&self.db_name);
        if let Some(password) = &self.db_password {
            options = options.password(password);
        }
        Ok(options)
    }
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
