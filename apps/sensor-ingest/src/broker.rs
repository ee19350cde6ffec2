use crate::config::Config;
use crate::reading::RawMessage;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker client rejected request: {0}")]
    Client(#[from] ClientError),
    #[error("broker connection lost after {attempts} attempts: {reason}")]
    ConnectionLost { attempts: u32, reason: String },
    #[error("broker event pump stopped")]
    Closed,
}

/// Where messages come from. Implemented by [`BrokerAdapter`] for MQTT.
#[async_trait]
pub trait MessageSource: Send {
    /// Resolves once the link is up and the subscription has been requested.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Suspends until the next message. Never ends on its own; an error means
    /// the link is gone for good.
    async fn next_message(&mut self) -> Result<RawMessage, BrokerError>;

    async fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn state(&self) -> ConnectionState;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connecting, Disconnected)
                | (Connected, Connecting)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Applies a validated transition. Re-entering the current state is a no-op.
fn transition(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        assert!(
            current.can_transition_to(next),
            "invalid broker state transition {current:?} -> {next:?}"
        );
        tracing::debug!(from = ?current, to = ?next, "broker state");
        *current = next;
        true
    });
}

enum Inbound {
    Message(RawMessage),
    Failed(BrokerError),
}

struct PumpHandle {
    client: AsyncClient,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct BrokerAdapter {
    options: MqttOptions,
    topic_filter: String,
    maintenance_interval: Duration,
    max_reconnect_attempts: u32,
    disconnect_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    pump: Option<PumpHandle>,
}

impl BrokerAdapter {
    pub fn new(config: &Config) -> Self {
        let mut options = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        options.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            options.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            options,
            topic_filter: config.topic_filter(),
            maintenance_interval: config.maintenance_interval(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            disconnect_timeout: config.disconnect_timeout(),
            state: Arc::new(state),
            inbound: None,
            pump: None,
        }
    }
}

#[async_trait]
impl MessageSource for BrokerAdapter {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        let current = self.state();
        assert_eq!(
            current,
            ConnectionState::Disconnected,
            "connect() called while broker link is {current:?}"
        );
        transition(&self.state, ConnectionState::Connecting);

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let pump = EventPump {
            client: client.clone(),
            eventloop,
            state: self.state.clone(),
            inbound: inbound_tx,
            topic_filter: self.topic_filter.clone(),
            maintenance_interval: self.maintenance_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
            stop: stop.clone(),
        };
        let task = tokio::spawn(pump.run());
        self.pump = Some(PumpHandle { client, stop, task });
        self.inbound = Some(inbound_rx);

        let mut state_rx = self.state.subscribe();
        let reached = state_rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Disconnected
                )
            })
            .await
            .map(|state| *state)
            .map_err(|_| BrokerError::Closed)?;
        if reached == ConnectionState::Connected {
            tracing::info!(topic = %self.topic_filter, "broker connected");
            return Ok(());
        }

        // The pump gave up before the first connack; it left the reason behind.
        let reason = match self.inbound.as_mut().map(|rx| rx.try_recv()) {
            Some(Ok(Inbound::Failed(err))) => err,
            _ => BrokerError::Closed,
        };
        if let Some(pump) = self.pump.take() {
            pump.stop.cancel();
            let _ = pump.task.await;
        }
        self.inbound = None;
        Err(reason)
    }

    async fn next_message(&mut self) -> Result<RawMessage, BrokerError> {
        let Some(inbound) = self.inbound.as_mut() else {
            return Err(BrokerError::Closed);
        };
        match inbound.recv().await {
            Some(Inbound::Message(message)) => Ok(message),
            Some(Inbound::Failed(err)) => Err(err),
            None => Err(BrokerError::Closed),
        }
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        let current = self.state();
        assert!(
            matches!(
                current,
                ConnectionState::Connected | ConnectionState::Connecting
            ),
            "disconnect() called while broker link is {current:?}"
        );
        let Some(pump) = self.pump.take() else {
            transition(&self.state, ConnectionState::Disconnected);
            return Ok(());
        };
        transition(&self.state, ConnectionState::Disconnecting);

        if let Err(err) = pump.client.try_disconnect() {
            tracing::warn!(error = %err, "failed to request broker disconnect");
        }

        let mut state_rx = self.state.subscribe();
        let acknowledged = timeout(
            self.disconnect_timeout,
            state_rx.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .map(|waited| waited.is_ok())
        .unwrap_or(false);
        if !acknowledged {
            tracing::warn!(
                timeout_ms = self.disconnect_timeout.as_millis() as u64,
                "broker did not confirm disconnect in time; stopping event pump"
            );
        }

        pump.stop.cancel();
        if let Err(err) = pump.task.await {
            tracing::warn!(error = %err, "broker event pump ended abnormally");
        }
        transition(&self.state, ConnectionState::Disconnected);
        self.inbound = None;
        tracing::info!("broker disconnected");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for BrokerAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.stop.cancel();
        }
    }
}

/// Drives the rumqttc event loop and turns its events into state changes and
/// buffered messages. Nothing in here waits on a consumer.
struct EventPump {
    client: AsyncClient,
    eventloop: EventLoop,
    state: Arc<watch::Sender<ConnectionState>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    topic_filter: String,
    maintenance_interval: Duration,
    max_reconnect_attempts: u32,
    stop: CancellationToken,
}

impl EventPump {
    async fn run(mut self) {
        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        maintenance.reset();
        let mut failures: u32 = 0;
        let mut backing_off = false;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                event = self.eventloop.poll(), if !backing_off => {
                    match event {
                        Ok(event) => {
                            if failures > 0 && matches!(event, Event::Incoming(Incoming::ConnAck(_))) {
                                tracing::info!(attempts = failures, "broker link restored");
                                failures = 0;
                            }
                            if !self.on_event(event) {
                                break;
                            }
                        }
                        Err(err) => {
                            if *self.state.borrow() == ConnectionState::Disconnecting {
                                transition(&self.state, ConnectionState::Disconnected);
                                break;
                            }
                            failures = failures.saturating_add(1);
                            if self.max_reconnect_attempts != 0 && failures > self.max_reconnect_attempts {
                                tracing::error!(error = %err, attempts = failures, "giving up on broker connection");
                                let _ = self.inbound.send(Inbound::Failed(BrokerError::ConnectionLost {
                                    attempts: failures,
                                    reason: err.to_string(),
                                }));
                                transition(&self.state, ConnectionState::Disconnected);
                                break;
                            }
                            tracing::warn!(error = %err, attempt = failures, "broker connection dropped; reconnecting");
                            transition(&self.state, ConnectionState::Connecting);
                            backing_off = true;
                            maintenance.reset();
                        }
                    }
                }
                // Reconnect bookkeeping: a failed poll parks the loop until the next tick.
                _ = maintenance.tick(), if backing_off => {
                    backing_off = false;
                    tracing::debug!(attempt = failures + 1, "retrying broker connection");
                }
            }
        }

        // Stopped from outside (disconnect timeout or adapter dropped).
        if *self.state.borrow() != ConnectionState::Disconnected {
            transition(&self.state, ConnectionState::Disconnected);
        }
    }

    /// Returns false once the pump should stop.
    fn on_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => {
                if *self.state.borrow() == ConnectionState::Disconnecting {
                    return true;
                }
                // Clean sessions drop subscriptions, so every connack subscribes again.
                if let Err(err) = self
                    .client
                    .try_subscribe(self.topic_filter.clone(), QoS::AtLeastOnce)
                {
                    tracing::error!(error = %err, topic = %self.topic_filter, "failed to subscribe");
                    let _ = self.inbound.send(Inbound::Failed(err.into()));
                    transition(&self.state, ConnectionState::Disconnected);
                    return false;
                }
                transition(&self.state, ConnectionState::Connected);
            }
            Event::Incoming(Incoming::SubAck(ack)) => {
                tracing::info!(topic = %self.topic_filter, pkid = ack.pkid, "subscribed to sensor feed");
            }
            Event::Incoming(Incoming::Publish(publish)) => {
                let _ = self
                    .inbound
                    .send(Inbound::Message(RawMessage::new(publish.topic, publish.payload)));
            }
            Event::Incoming(Incoming::Disconnect) => {
                tracing::warn!("broker sent disconnect");
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                if *self.state.borrow() == ConnectionState::Disconnecting {
                    transition(&self.state, ConnectionState::Disconnected);
                    return false;
                }
            }
            _ => {}
        }
        true
    }
}
