use crate::broker::{BrokerError, ConnectionState, MessageSource};
use crate::config::{Config, MalformedPolicy};
use crate::reading::{RawMessage, Reading, ReadingKind};
use crate::store::{ReadingStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub fn test_config() -> Config {
    Config {
        database_url: None,
        db_host: "localhost".to_string(),
        db_port: 5432,
        db_user: "postgres".to_string(),
        db_password: None,
        db_name: "sensors".to_string(),
        mqtt_host: "127.0.0.1".to_string(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_client_id: "sensor-ingest-test".to_string(),
        mqtt_topic_prefix: "devices".to_string(),
        mqtt_keepalive_secs: 30,
        maintenance_interval_ms: 1000,
        max_reconnect_attempts: 10,
        disconnect_timeout_ms: 5000,
        malformed_policy: MalformedPolicy::Fail,
    }
}

pub fn reading(device: &str, kind: &str, ts: &str, value: Option<f64>) -> Reading {
    Reading {
        device: device.to_string(),
        timestamp: DateTime::parse_from_rfc3339(ts).expect("timestamp"),
        kind: ReadingKind::from_segment(kind),
        value,
    }
}

/// Shared, ordered record of what the doubles were asked to do.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().expect("journal lock").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("journal lock").clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn last_position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().rposition(|e| e == entry)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StoredRow {
    pub temperature: Option<f64>,
    pub relative_humidity: Option<f64>,
}

#[derive(Default)]
struct StoreInner {
    rows: BTreeMap<(String, DateTime<Utc>), StoredRow>,
    fail_devices: HashSet<String>,
    closed: bool,
    delay: Option<Duration>,
}

/// Keeps rows the way the table does: one per (device, instant), each kind
/// overwriting only its own column, and any null value rejected.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    journal: Journal,
}

impl MemoryStore {
    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = journal.clone();
        self
    }

    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn fail_on_device(&self, device: &str) {
        self.lock().fail_devices.insert(device.to_string());
    }

    pub fn rows(&self) -> Vec<((String, DateTime<Utc>), StoredRow)> {
        self.lock()
            .rows
            .iter()
            .map(|(key, row)| (key.clone(), *row))
            .collect()
    }

    pub fn row(&self, device: &str, ts: &str) -> StoredRow {
        let at = DateTime::parse_from_rfc3339(ts)
            .expect("timestamp")
            .with_timezone(&Utc);
        *self
            .lock()
            .rows
            .get(&(device.to_string(), at))
            .unwrap_or_else(|| panic!("no row for {device} at {ts}"))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store lock")
    }

    async fn upsert(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
        apply: impl FnOnce(&mut StoredRow, f64),
    ) -> Result<(), StoreError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.lock();
        if inner.closed {
            return Err(StoreError::Closed);
        }
        if inner.fail_devices.contains(device) {
            return Err(StoreError::Execute(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset by peer",
            ))));
        }

        // The check runs on the candidate insert row before the conflict is
        // resolved, so a null value is rejected even when the row exists.
        let Some(value) = value else {
            return Err(StoreError::Rejected(sqlx::Error::Protocol(
                "new row violates check constraint \"sensor_reading_has_value\"".to_string(),
            )));
        };
        let key = (device.to_string(), timestamp.with_timezone(&Utc));
        let row = inner.rows.entry(key).or_default();
        apply(row, value);
        drop(inner);
        self.journal.record(format!("upsert {device}"));
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn upsert_temperature(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError> {
        self.upsert(device, timestamp, value, |row, v| row.temperature = Some(v))
            .await
    }

    async fn upsert_relative_humidity(
        &mut self,
        device: &str,
        timestamp: DateTime<FixedOffset>,
        value: Option<f64>,
    ) -> Result<(), StoreError> {
        self.upsert(device, timestamp, value, |row, v| {
            row.relative_humidity = Some(v)
        })
        .await
    }

    async fn close(&mut self) {
        self.lock().closed = true;
        self.journal.record("close");
    }
}

enum Scripted {
    Message(RawMessage),
    Fail(BrokerError),
}

/// Message source fed by a [`SourceHandle`] instead of a broker.
pub struct ScriptedSource {
    script: mpsc::UnboundedReceiver<Scripted>,
    connect_error: Option<BrokerError>,
    state: ConnectionState,
    delivered: watch::Sender<usize>,
    journal: Journal,
}

pub struct SourceHandle {
    script: mpsc::UnboundedSender<Scripted>,
    delivered: watch::Receiver<usize>,
}

pub fn scripted_source(journal: &Journal) -> (ScriptedSource, SourceHandle) {
    let (script_tx, script_rx) = mpsc::unbounded_channel();
    let (delivered_tx, delivered_rx) = watch::channel(0);
    (
        ScriptedSource {
            script: script_rx,
            connect_error: None,
            state: ConnectionState::Disconnected,
            delivered: delivered_tx,
            journal: journal.clone(),
        },
        SourceHandle {
            script: script_tx,
            delivered: delivered_rx,
        },
    )
}

impl ScriptedSource {
    pub fn failing_connect(mut self, err: BrokerError) -> Self {
        self.connect_error = Some(err);
        self
    }
}

impl SourceHandle {
    pub fn publish(&self, topic: &str, payload: impl Into<String>) {
        let message = RawMessage::new(topic, payload.into().into_bytes());
        let _ = self.script.send(Scripted::Message(message));
    }

    pub fn fail(&self, err: BrokerError) {
        let _ = self.script.send(Scripted::Fail(err));
    }

    /// Resolves once `count` messages have been handed to the receive task.
    pub async fn wait_delivered(&mut self, count: usize) {
        self.delivered
            .wait_for(|delivered| *delivered >= count)
            .await
            .expect("source dropped before delivering");
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        assert_eq!(self.state, ConnectionState::Disconnected);
        self.journal.record("connect");
        if let Some(err) = self.connect_error.take() {
            return Err(err);
        }
        self.state = ConnectionState::Connected;
        Ok(())
    }

    async fn next_message(&mut self) -> Result<RawMessage, BrokerError> {
        match self.script.recv().await {
            Some(Scripted::Message(message)) => {
                self.delivered.send_modify(|delivered| *delivered += 1);
                Ok(message)
            }
            Some(Scripted::Fail(err)) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
            // A silent broker: nothing more ever arrives.
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.journal.record("disconnect");
        self.state = ConnectionState::Disconnected;
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}
