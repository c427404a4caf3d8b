//! WebSocket implementation of [`RealtimeTransport`] with automatic
//! reconnection and channel rejoin.

use crate::transport::{ChannelKey, ConnectionStatus, RealtimeTransport, TransportEvent};
use async_trait::async_trait;
use chat_types::{RawChangeEvent, SyncError, SyncResult};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Realtime endpoint URL (e.g. `wss://chat.example.co/realtime`).
    pub url: String,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Base reconnect delay in seconds.
    pub reconnect_base_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub reconnect_max_delay_secs: u64,
    /// Maximum reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            heartbeat_interval_secs: 30,
            reconnect_base_delay_secs: 2,
            reconnect_max_delay_secs: 30,
            max_reconnect_attempts: 10,
        }
    }
}

/// Reconnect delay in seconds for the given attempt (1-based), doubling from
/// the base up to the cap.
pub fn compute_backoff(attempt: u32, base_delay_secs: u64, max_delay_secs: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(31);
    std::cmp::min(
        base_delay_secs.saturating_mul(2u64.saturating_pow(exponent)),
        max_delay_secs,
    )
}

/// Wire frames exchanged with the realtime endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Auth {
        token: String,
    },
    Subscribe {
        channel: String,
        table: String,
        filter: String,
    },
    Unsubscribe {
        channel: String,
    },
    Heartbeat,
    Event {
        channel: String,
        #[serde(flatten)]
        change: RawChangeEvent,
    },
    Error {
        message: String,
    },
}

impl Frame {
    fn to_message(&self) -> SyncResult<Message> {
        let json = serde_json::to_string(self)?;
        Ok(Message::Text(json.into()))
    }
}

/// WebSocket transport that keeps the set of desired channels and rejoins
/// all of them after every reconnect. Consumers observe connectivity through
/// the status watch and refetch on the disconnected→connected edge.
pub struct WebSocketTransport {
    config: WebSocketConfig,
    /// Channels that should be open; the source of truth for rejoin.
    desired: RwLock<HashMap<ChannelKey, (String, String)>>,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    events_tx: broadcast::Sender<TransportEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    access_token: RwLock<Option<String>>,
    reconnect_attempts: RwLock<u32>,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            config,
            desired: RwLock::new(HashMap::new()),
            sender: Mutex::new(None),
            events_tx,
            status_tx,
            access_token: RwLock::new(None),
            reconnect_attempts: RwLock::new(0),
        })
    }

    /// Connects and runs the read loop until the connection drops for good.
    /// Callers spawn this; reconnection is handled internally.
    pub async fn connect(self: &Arc<Self>, access_token: &str) -> SyncResult<()> {
        if self.status_tx.borrow().is_connected() {
            debug!("already connected");
            return Ok(());
        }
        *self.access_token.write().await = Some(access_token.to_string());
        *self.reconnect_attempts.write().await = 0;
        self.run_connection().await
    }

    /// Stops reconnecting and drops the connection.
    pub async fn disconnect(&self) {
        *self.reconnect_attempts.write().await = self.config.max_reconnect_attempts + 1;
        *self.access_token.write().await = None;
        if let Some(sender) = self.sender.lock().await.take() {
            drop(sender);
        }
        let _ = self.status_tx.send(ConnectionStatus::Disconnected);
        info!("realtime transport disconnected");
    }

    async fn run_connection(self: &Arc<Self>) -> SyncResult<()> {
        let _ = self.status_tx.send(ConnectionStatus::Connecting);
        info!(url = %self.config.url, "connecting realtime transport");

        let (ws_stream, _) = connect_async(&self.config.url)
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(100);
        *self.sender.lock().await = Some(msg_tx.clone());

        let token = self
            .access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| SyncError::Network("no access token".to_string()))?;
        write
            .send(Frame::Auth { token }.to_message()?)
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        // Outbound writer task.
        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Heartbeat task.
        let heartbeat_sender = msg_tx.clone();
        let heartbeat_secs = self.config.heartbeat_interval_secs;
        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(heartbeat_secs));
            loop {
                ticker.tick().await;
                match Frame::Heartbeat.to_message() {
                    Ok(msg) => {
                        if heartbeat_sender.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let _ = self.status_tx.send(ConnectionStatus::Connected);
        *self.reconnect_attempts.write().await = 0;
        self.rejoin_channels(&msg_tx).await;
        info!("realtime transport connected");

        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
                Ok(Message::Ping(data)) => {
                    let _ = msg_tx.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    info!("realtime connection closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "websocket error");
                    break;
                }
            }
        }

        heartbeat_handle.abort();
        writer_handle.abort();
        *self.sender.lock().await = None;
        let _ = self.status_tx.send(ConnectionStatus::Disconnected);

        self.schedule_reconnect().await;
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<Frame>(text) {
            Ok(Frame::Event { channel, change }) => {
                let event = TransportEvent {
                    channel_key: ChannelKey::new(channel),
                    change: change.decode(),
                };
                let _ = self.events_tx.send(event);
            }
            Ok(Frame::Error { message }) => {
                warn!(error = %message, "realtime server error");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "unparseable realtime frame");
            }
        }
    }

    /// Re-subscribes every desired channel on a fresh connection.
    async fn rejoin_channels(&self, sender: &mpsc::Sender<Message>) {
        let desired = self.desired.read().await;
        for (key, (table, filter)) in desired.iter() {
            let frame = Frame::Subscribe {
                channel: key.as_str().to_string(),
                table: table.clone(),
                filter: filter.clone(),
            };
            match frame.to_message() {
                Ok(msg) => {
                    if sender.send(msg).await.is_err() {
                        warn!(channel = %key, "failed to rejoin channel");
                    }
                }
                Err(e) => warn!(channel = %key, error = %e, "failed to encode rejoin"),
            }
        }
        debug!(count = desired.len(), "rejoined channels");
    }

    async fn schedule_reconnect(self: &Arc<Self>) {
        let mut attempts = self.reconnect_attempts.write().await;
        *attempts += 1;
        if *attempts > self.config.max_reconnect_attempts {
            warn!("max reconnect attempts reached");
            return;
        }
        let delay = compute_backoff(
            *attempts,
            self.config.reconnect_base_delay_secs,
            self.config.reconnect_max_delay_secs,
        );
        info!(attempt = *attempts, delay_secs = delay, "scheduling reconnect");
        drop(attempts);

        tokio::time::sleep(Duration::from_secs(delay)).await;

        if self.access_token.read().await.is_some() {
            if let Err(e) = Box::pin(self.run_connection()).await {
                error!(error = %e, "reconnect failed");
            }
        }
    }

    async fn send_frame(&self, frame: Frame) -> SyncResult<()> {
        let sender = self.sender.lock().await;
        let Some(sender) = sender.as_ref() else {
            // Offline; the desired set drives a rejoin once connected.
            return Ok(());
        };
        let msg = frame.to_message()?;
        sender
            .send(msg)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn open_channel(&self, key: &ChannelKey, table: &str, filter: &str) -> SyncResult<()> {
        self.desired
            .write()
            .await
            .insert(key.clone(), (table.to_string(), filter.to_string()));
        self.send_frame(Frame::Subscribe {
            channel: key.as_str().to_string(),
            table: table.to_string(),
            filter: filter.to_string(),
        })
        .await
    }

    async fn close_channel(&self, key: &ChannelKey) -> SyncResult<()> {
        self.desired.write().await.remove(key);
        self.send_frame(Frame::Unsubscribe {
            channel: key.as_str().to_string(),
        })
        .await
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}
