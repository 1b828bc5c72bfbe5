//! Single relay connection management.
//!
//! Owns one WebSocket to one relay: connect/disconnect lifecycle, the
//! background receive loop, and frame sending. Inbound frames are parsed and
//! fanned out on a broadcast channel; state changes are published on a watch
//! channel so the pool can react to unexpected closes.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr_core::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Open,
    /// Not connected
    Closed,
    /// Last attempt or session ended with an error
    Error,
}

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One WebSocket connection to one relay.
pub struct RelayConnection {
    url: Url,
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    writer: Arc<Mutex<Option<WsSink>>>,
    messages_tx: broadcast::Sender<RelayMessage>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet).
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, ConnectionConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: ConnectionConfig) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let (messages_tx, _) = broadcast::channel(1000);

        Ok(Self {
            url,
            config,
            state_tx,
            state_rx,
            writer: Arc::new(Mutex::new(None)),
            messages_tx,
            recv_task: Mutex::new(None),
        })
    }

    /// Relay URL.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Check if the connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Watch state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to parsed inbound frames.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.messages_tx.subscribe()
    }

    /// Connect to the relay.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open | ConnectionState::Connecting => {
                return Err(ClientError::AlreadyConnected);
            }
            _ => {}
        }
        let _ = self.state_tx.send(ConnectionState::Connecting);

        info!("Connecting to relay: {}", self.url);

        let ws_stream = match timeout(
            self.config.connect_timeout,
            connect_async(self.url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let _ = self.state_tx.send(ConnectionState::Error);
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                let _ = self.state_tx.send(ConnectionState::Error);
                return Err(ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (sink, stream) = ws_stream.split();
        *self.writer.lock().await = Some(sink);
        let _ = self.state_tx.send(ConnectionState::Open);

        self.start_recv_loop(stream).await;

        info!("Connected to relay: {}", self.url);
        Ok(())
    }

    /// Spawn the background receive loop for one session.
    async fn start_recv_loop(&self, mut stream: WsSource) {
        let writer = Arc::clone(&self.writer);
        let state_tx = self.state_tx.clone();
        let messages_tx = self.messages_tx.clone();
        let url = self.url.to_string();

        let handle = tokio::spawn(async move {
            let mut errored = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(text.as_str()) {
                        Ok(msg) => {
                            let _ = messages_tx.send(msg);
                        }
                        Err(e) => {
                            debug!("Dropping unparseable frame from {}: {}", url, e);
                        }
                    },
                    Ok(Message::Ping(data)) => {
                        let mut w = writer.lock().await;
                        if let Some(sink) = w.as_mut() {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Relay {} closed connection", url);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", url, e);
                        errored = true;
                        break;
                    }
                }
            }

            *writer.lock().await = None;
            // Do not overwrite a deliberate Closed with Error
            let final_state = if errored {
                ConnectionState::Error
            } else {
                ConnectionState::Closed
            };
            if *state_tx.borrow() == ConnectionState::Open {
                let _ = state_tx.send(final_state);
            }
        });

        *self.recv_task.lock().await = Some(handle);
    }

    /// Disconnect from the relay.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        let _ = self.state_tx.send(ConnectionState::Closed);

        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }
        info!("Disconnected from relay: {}", self.url);
    }

    /// Send a protocol frame to the relay.
    pub async fn send_frame(&self, msg: &ClientMessage) -> Result<()> {
        let json = msg.to_json().map_err(|e| ClientError::Protocol(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ClientError::NotConnected)?;
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            // A failed write means the session is gone
            *writer = None;
            let _ = self.state_tx.send(ConnectionState::Error);
            return Err(ClientError::WebSocket(e.to_string()));
        }
        Ok(())
    }

    /// Publish an event: ["EVENT", event].
    pub async fn publish(&self, event: &Event) -> Result<()> {
        self.send_frame(&ClientMessage::Event(event.clone())).await
    }

    /// Open a subscription: ["REQ", id, filters...].
    pub async fn subscribe(&self, subscription_id: &str, filters: Vec<Filter>) -> Result<()> {
        self.send_frame(&ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters,
        })
        .await
    }

    /// Close a subscription: ["CLOSE", id].
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.send_frame(&ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_url() {
        assert!(RelayConnection::new("https://relay.example.com").is_err());
        assert!(RelayConnection::new("not a url").is_err());
    }

    #[test]
    fn test_accepts_websocket_urls() {
        assert!(RelayConnection::new("ws://relay.example.com").is_ok());
        assert!(RelayConnection::new("wss://relay.example.com").is_ok());
    }

    #[test]
    fn test_initial_state_closed() {
        let conn = RelayConnection::new("wss://relay.example.com").unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_send_when_not_connected() {
        let conn = RelayConnection::new("wss://relay.example.com").unwrap();
        let result = conn
            .send_frame(&ClientMessage::Close {
                subscription_id: "sub1".to_string(),
            })
            .await;
        assert!(matches!(result, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_refused_sets_error_state() {
        let conn = RelayConnection::new("ws://127.0.0.1:1").unwrap();
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_disconnect_when_closed_is_noop() {
        let conn = RelayConnection::new("wss://relay.example.com").unwrap();
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
