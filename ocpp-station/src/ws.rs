//! WebSocket transport
//!
//! Implements the engine's `Connection` boundary over tokio-tungstenite.
//! The connection task owns the socket: it connects with the OCPP
//! subprotocol, reconnects with exponential backoff, and shuttles text
//! frames through unbounded channels. The poll-driven engine side only sees
//! `send_text` / `is_connected` / `poll_incoming`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        handshake::client::Request as WsRequest,
        http::{header, Uri},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use ocpp_rpc::Connection;

use crate::config::StationConfig;

/// OCPP 1.6 WebSocket subprotocol.
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Transport-level settings.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Full WebSocket URL including the station id.
    pub url: String,
    /// Initial reconnect delay.
    pub reconnect_delay: Duration,
    /// Backoff cap.
    pub max_reconnect_delay: Duration,
    /// WebSocket-level message size cap. Kept above the engine's frame cap
    /// so oversized frames still arrive and get the header-recovery reply.
    pub max_message_size: usize,
}

impl WsConfig {
    pub fn for_station(config: &StationConfig) -> Self {
        Self {
            url: config.ws_url(),
            reconnect_delay: config.reconnect_delay,
            max_reconnect_delay: config.max_reconnect_delay,
            max_message_size: 64 * 1024,
        }
    }
}

/// `Connection` implementation backed by a spawned WebSocket task.
pub struct WsConnection {
    outgoing_tx: mpsc::UnboundedSender<String>,
    incoming_rx: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
}

impl WsConnection {
    /// Spawn the connection task on the current tokio runtime.
    pub fn spawn(config: WsConfig) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_connection(
            config,
            outgoing_rx,
            incoming_tx,
            connected.clone(),
        ));

        Self {
            outgoing_tx,
            incoming_rx,
            connected,
        }
    }
}

impl Connection for WsConnection {
    fn send_text(&mut self, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.outgoing_tx.send(text.to_string()).is_ok()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn poll_incoming(&mut self) -> Option<String> {
        self.incoming_rx.try_recv().ok()
    }
}

enum SessionEnd {
    /// The engine side dropped its handle; stop for good.
    Shutdown,
    /// The link died; reconnect.
    Disconnected,
}

async fn run_connection(
    config: WsConfig,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    incoming_tx: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
) {
    let mut delay = config.reconnect_delay;

    loop {
        info!(url = %config.url, "connecting to CSMS");

        let end = run_session(&config, &mut outgoing_rx, &incoming_tx, &connected).await;
        connected.store(false, Ordering::SeqCst);

        match end {
            SessionEnd::Shutdown => {
                info!("connection task shutting down");
                return;
            }
            SessionEnd::Disconnected => {
                info!("reconnecting in {:?}", delay);
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, config.max_reconnect_delay);
            }
        }
    }
}

async fn run_session(
    config: &WsConfig,
    outgoing_rx: &mut mpsc::UnboundedReceiver<String>,
    incoming_tx: &mpsc::UnboundedSender<String>,
    connected: &Arc<AtomicBool>,
) -> SessionEnd {
    let uri: Uri = match config.url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!("invalid CSMS URL {}: {}", config.url, e);
            return SessionEnd::Disconnected;
        }
    };

    let request = match WsRequest::builder()
        .uri(config.url.as_str())
        .header(header::SEC_WEBSOCKET_PROTOCOL, OCPP_SUBPROTOCOL)
        .header(header::HOST, uri.host().unwrap_or("localhost"))
        .body(())
    {
        Ok(request) => request,
        Err(e) => {
            error!("failed to build handshake request: {}", e);
            return SessionEnd::Disconnected;
        }
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        ..Default::default()
    };

    let (ws_stream, response) = match connect_async_with_config(request, Some(ws_config), false).await
    {
        Ok(pair) => pair,
        Err(e) => {
            error!("WebSocket connection failed: {}", e);
            return SessionEnd::Disconnected;
        }
    };

    let accepted_protocol = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "CSMS did not accept {} subprotocol, got: {:?}",
            OCPP_SUBPROTOCOL, accepted_protocol
        );
    }

    info!(url = %config.url, "WebSocket connected");
    connected.store(true, Ordering::SeqCst);

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    loop {
        tokio::select! {
            out = outgoing_rx.recv() => match out {
                Some(text) => {
                    debug!("sending: {}", text);
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        error!("failed to send WebSocket message: {}", e);
                        return SessionEnd::Disconnected;
                    }
                }
                None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    debug!("received: {}", text);
                    if incoming_tx.send(text.to_string()).is_err() {
                        return SessionEnd::Shutdown;
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    info!("WebSocket closed by server");
                    return SessionEnd::Disconnected;
                }
                Some(Ok(Message::Ping(_))) => {
                    // Pong is sent by tungstenite itself.
                    debug!("received ping");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return SessionEnd::Disconnected;
                }
                None => {
                    info!("WebSocket stream ended");
                    return SessionEnd::Disconnected;
                }
            }
        }
    }
}
