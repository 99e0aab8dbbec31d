//! Transport Adapter
//!
//! Connects to the agent service and keeps the connection alive across drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::options::TransportOptions;
use super::registry::{EventHandler, HandlerRegistry, InboundEvent};
use crate::error::{ProtocolError, TransportError};
use crate::protocol::{
    Endpoint, EnginePacket, Handshake, SocketPacket, EVENT_CONNECT, EVENT_DISCONNECT,
    EVENT_MALFORMED_FRAME, RESERVED_EVENTS,
};
use crate::types::ConnectionStatus;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection ended without an error
enum Closed {
    /// The server went away; reconnect
    Remote,
    /// `disconnect` was called; stop for good
    Shutdown,
}

/// State shared between the adapter handle and its supervisor task
struct Shared {
    status: watch::Sender<ConnectionStatus>,
    epoch: AtomicU64,
    /// Writer queue of the live connection, if any
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    handlers: HandlerRegistry,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            status,
            epoch: AtomicU64::new(0),
            outbound: Mutex::new(None),
            handlers: HandlerRegistry::default(),
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Message>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn mark_connected(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_outbound(Some(tx));
        self.status.send_replace(ConnectionStatus::Connected);
        self.handlers
            .dispatch(&InboundEvent::new(EVENT_CONNECT, Value::Null, epoch));
        epoch
    }

    /// Idempotent; only a Connected→Disconnected flip notifies handlers
    fn mark_disconnected(&self) {
        self.set_outbound(None);
        let prev = self.status.send_replace(ConnectionStatus::Disconnected);
        if prev.is_connected() {
            let epoch = self.epoch.load(Ordering::SeqCst);
            self.handlers
                .dispatch(&InboundEvent::new(EVENT_DISCONNECT, Value::Null, epoch));
        }
    }

    fn deliver(&self, name: String, data: Value, epoch: u64) {
        if RESERVED_EVENTS.contains(&name.as_str()) {
            warn!(event = %name, epoch, "Server used a reserved event name");
            return;
        }
        let event = InboundEvent::new(name, data, epoch);
        if self.handlers.dispatch(&event) == 0 {
            debug!(event = %event.name, epoch, "No handler for event");
        }
    }

    fn deliver_malformed(&self, error: &ProtocolError, epoch: u64) {
        warn!(epoch, error = %error, "Dropping undecodable frame");
        self.handlers.dispatch(&InboundEvent::new(
            EVENT_MALFORMED_FRAME,
            json!({ "reason": error.to_string() }),
            epoch,
        ));
    }
}

fn text_frame(packet: &EnginePacket) -> anyhow::Result<Message> {
    Ok(Message::Text(packet.encode()?))
}

/// Transport adapter owning one persistent connection to the agent service
///
/// Creating a second adapter for the same logical session is a caller error.
pub struct TransportAdapter {
    options: TransportOptions,
    shared: Arc<Shared>,
    endpoint: Option<Endpoint>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl TransportAdapter {
    /// Create a disconnected adapter
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared::new()),
            endpoint: None,
            shutdown_tx: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Whether a supervisor task is running (between `connect` and `disconnect`)
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Epoch of the most recent successful connection (0 before the first)
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Watch connection status changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Register a handler for a named event
    ///
    /// Handlers fire once per received event, in arrival order; several
    /// handlers for the same name fire in registration order. The
    /// `connect`, `disconnect` and `malformed_frame` pseudo-events use the
    /// same registry.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.shared.handlers.register(event, handler);
    }

    /// Start connecting to the server at `server_url` (idempotent while running)
    ///
    /// Accepts `http(s)://` and `ws(s)://` URLs. Returns once the supervisor
    /// task is spawned; the connection itself is established asynchronously
    /// and retried per the reconnect policy. Must be called from within a
    /// tokio runtime.
    pub fn connect(&mut self, server_url: &str) -> Result<(), TransportError> {
        if self.shutdown_tx.is_some() {
            debug!(url = server_url, "Transport already running");
            return Ok(());
        }
        let endpoint = Endpoint::parse(server_url)?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.endpoint = Some(endpoint.clone());

        tokio::spawn(Self::supervise(
            endpoint,
            self.options.clone(),
            self.shared.clone(),
            shutdown_rx,
        ));

        Ok(())
    }

    /// Wait until the adapter reports Connected; false on timeout
    pub async fn wait_for_connection(&self, limit: Duration) -> bool {
        let mut rx = self.shared.status.subscribe();
        let reached = matches!(
            timeout(limit, rx.wait_for(|status| status.is_connected())).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Tear down the connection and stop reconnecting
    pub fn disconnect(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!(url = ?self.endpoint.as_ref().map(|e| e.url.as_str()), "Transport disconnected");
        }
        self.shared.mark_disconnected();
    }

    /// Queue an event for delivery (at-most-once, never retried)
    pub fn send(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let namespace = self
            .endpoint
            .as_ref()
            .map(|e| e.namespace.as_str())
            .ok_or(TransportError::NotConnected)?;
        let text = SocketPacket::event(namespace, event, payload).to_frame()?;

        let outbound = self
            .shared
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    async fn supervise(
        endpoint: Endpoint,
        options: TransportOptions,
        shared: Arc<Shared>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let url = endpoint.url.to_string();
        let mut attempt: u32 = 0;

        loop {
            let result =
                Self::connection_loop(&endpoint, &options, &shared, &mut attempt, &mut shutdown_rx)
                    .await;
            match result {
                Ok(Closed::Shutdown) => {
                    debug!(url = %url, "Transport shutting down");
                    break;
                }
                Ok(Closed::Remote) => warn!(url = %url, "Agent connection closed, reconnecting..."),
                Err(e) => warn!(url = %url, error = %e, "Agent connection lost, reconnecting..."),
            }

            shared.mark_disconnected();

            let delay = options.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => break,
            }
        }

        // A connect that raced the shutdown must not leave us Connected
        shared.mark_disconnected();
    }

    /// Open the WebSocket and join the namespace, bounded by `connect_timeout`
    async fn open(endpoint: &Endpoint, options: &TransportOptions) -> anyhow::Result<(WsStream, Handshake)> {
        timeout(options.connect_timeout, async {
            let (mut ws, _) = connect_async(endpoint.url.as_str()).await?;
            let handshake = Self::handshake(&mut ws, &endpoint.namespace).await?;
            Ok::<_, anyhow::Error>((ws, handshake))
        })
        .await
        .map_err(|_| anyhow!("connect timed out after {:?}", options.connect_timeout))?
    }

    async fn handshake(ws: &mut WsStream, namespace: &str) -> anyhow::Result<Handshake> {
        let handshake = match Self::next_packet(ws).await? {
            EnginePacket::Open(handshake) => handshake,
            other => bail!("expected open packet, got {:?}", other),
        };

        ws.send(Message::Text(SocketPacket::connect(namespace).to_frame()?))
            .await?;

        loop {
            match Self::next_packet(ws).await? {
                EnginePacket::Ping => ws.send(text_frame(&EnginePacket::Pong)?).await?,
                EnginePacket::Close => bail!("server closed during handshake"),
                EnginePacket::Message(body) => match SocketPacket::decode(&body)? {
                    SocketPacket::Connect { namespace: joined, .. } if joined == namespace => {
                        return Ok(handshake)
                    }
                    SocketPacket::ConnectError { data, .. } => {
                        bail!("server refused namespace {}: {}", namespace, data)
                    }
                    other => debug!(?other, "Ignoring packet before namespace join"),
                },
                _ => {}
            }
        }
    }

    async fn next_packet(ws: &mut WsStream) -> anyhow::Result<EnginePacket> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(EnginePacket::decode(&text)?),
                Some(Ok(Message::Close(_))) | None => bail!("connection closed during handshake"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn connection_loop(
        endpoint: &Endpoint,
        options: &TransportOptions,
        shared: &Shared,
        attempt: &mut u32,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<Closed> {
        let (ws_stream, handshake) = tokio::select! {
            opened = Self::open(endpoint, options) => opened?,
            _ = shutdown_rx.recv() => return Ok(Closed::Shutdown),
        };
        *attempt = 0;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let epoch = shared.mark_connected(out_tx);
        let namespace = endpoint.namespace.as_str();

        info!(url = %endpoint.url, namespace, sid = %handshake.sid, epoch, "Connected to agent server");

        // The server pings on its own schedule; silence past this is a dead link
        let liveness = handshake.liveness();
        let mut deadline = Instant::now() + liveness;

        loop {
            tokio::select! {
                // Outbound events queued by `send`
                Some(msg) = out_rx.recv() => {
                    ws_tx.send(msg).await?;
                }

                // Inbound frames, delivered in arrival order
                msg = ws_rx.next() => {
                    deadline = Instant::now() + liveness;
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, epoch, "Server closed connection");
                            return Ok(Closed::Remote);
                        }
                        None => return Ok(Closed::Remote),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => continue,
                    };

                    let packet = match EnginePacket::decode(&text) {
                        Ok(EnginePacket::Message(body)) => SocketPacket::decode(&body),
                        Ok(EnginePacket::Ping) => {
                            ws_tx.send(text_frame(&EnginePacket::Pong)?).await?;
                            continue;
                        }
                        Ok(EnginePacket::Close) => return Ok(Closed::Remote),
                        Ok(_) => continue,
                        Err(e) => Err(e),
                    };

                    match packet {
                        Ok(SocketPacket::Event { namespace: ns, name, data, .. }) if ns == namespace => {
                            shared.deliver(name, data, epoch);
                        }
                        Ok(SocketPacket::Disconnect { namespace: ns }) if ns == namespace => {
                            debug!(epoch, "Server dropped us from the namespace");
                            return Ok(Closed::Remote);
                        }
                        Ok(SocketPacket::ConnectError { data, .. }) => {
                            bail!("server error on namespace {}: {}", namespace, data);
                        }
                        Ok(other) => debug!(?other, epoch, "Ignoring packet"),
                        Err(e) => shared.deliver_malformed(&e, epoch),
                    }
                }

                _ = sleep_until(deadline) => {
                    bail!("no ping from server within {:?}", liveness);
                }

                _ = shutdown_rx.recv() => {
                    // Leave the namespace politely; the server may already be gone
                    let leave = SocketPacket::Disconnect { namespace: namespace.to_string() };
                    if let Ok(frame) = leave.to_frame() {
                        let _ = ws_tx.send(Message::Text(frame)).await;
                    }
                    let _ = ws_tx.close().await;
                    return Ok(Closed::Shutdown);
                }
            }
        }
    }
}

impl Drop for TransportAdapter {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
