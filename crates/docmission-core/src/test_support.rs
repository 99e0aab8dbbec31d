//! In-process agent server for tests
//!
//! Accepts Socket.IO clients over WebSocket on an ephemeral port, completes
//! the Engine.IO open and namespace join, then hands each connection to the
//! test, which scripts the server side packet by packet.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::protocol::{EnginePacket, Handshake, SocketPacket};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct TestAgentServer {
    url: String,
    connections: mpsc::UnboundedReceiver<TestConnection>,
    task: JoinHandle<()>,
}

impl TestAgentServer {
    pub(crate) async fn start() -> Self {
        Self::with_heartbeat(25_000, 20_000).await
    }

    /// Server announcing the given ping schedule (milliseconds) and never pinging
    pub(crate) async fn with_heartbeat(ping_interval: u64, ping_timeout: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut accepted = 0u32;
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                accepted += 1;
                let handshake = Handshake {
                    sid: format!("engine-{}", accepted),
                    upgrades: Vec::new(),
                    ping_interval,
                    ping_timeout,
                    max_payload: Some(1_000_000),
                };

                let mut conn = TestConnection {
                    ws,
                    namespace: "/".to_string(),
                };
                if conn.open(&handshake).await.is_none() {
                    continue;
                }
                if conn_tx.send(conn).is_err() {
                    break;
                }
            }
        });

        Self {
            url: format!("http://{}", addr),
            connections,
            task,
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Next client that completed the namespace join
    pub(crate) async fn accept(&mut self) -> TestConnection {
        timeout(STEP_TIMEOUT, self.connections.recv())
            .await
            .expect("no client connected in time")
            .expect("test server stopped")
    }
}

impl Drop for TestAgentServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) struct TestConnection {
    ws: WebSocketStream<TcpStream>,
    namespace: String,
}

impl TestConnection {
    async fn open(&mut self, handshake: &Handshake) -> Option<()> {
        let open = EnginePacket::Open(handshake.clone()).encode().ok()?;
        self.ws.send(Message::Text(open)).await.ok()?;

        let text = self.next_text().await?;
        let SocketPacket::Connect { namespace, .. } = socket_packet(&text)? else {
            return None;
        };
        let joined = SocketPacket::Connect {
            namespace: namespace.clone(),
            data: Some(json!({ "sid": format!("socket-{}", handshake.sid) })),
        };
        self.ws.send(Message::Text(joined.to_frame().ok()?)).await.ok()?;
        self.namespace = namespace;
        Some(())
    }

    async fn next_text(&mut self) -> Option<String> {
        loop {
            match timeout(STEP_TIMEOUT, self.ws.next()).await.ok()??.ok()? {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    pub(crate) async fn emit(&mut self, event: &str, data: Value) {
        let frame = SocketPacket::event(&self.namespace, event, data)
            .to_frame()
            .unwrap();
        self.send_raw(&frame).await;
    }

    pub(crate) async fn ping(&mut self) {
        self.send_raw("2").await;
    }

    pub(crate) async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next text frame from the client, undecoded
    pub(crate) async fn recv_raw(&mut self) -> String {
        self.next_text()
            .await
            .expect("client sent nothing in time")
    }

    /// Next event emitted by the client, as `(name, data)`
    pub(crate) async fn recv(&mut self) -> (String, Value) {
        loop {
            let text = self.recv_raw().await;
            if let Some(SocketPacket::Event { name, data, .. }) = socket_packet(&text) {
                return (name, data);
            }
        }
    }

    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the client acknowledges the close
        while let Ok(Some(Ok(_))) = timeout(STEP_TIMEOUT, self.ws.next()).await {}
    }
}

fn socket_packet(text: &str) -> Option<SocketPacket> {
    match EnginePacket::decode(text).ok()? {
        EnginePacket::Message(body) => SocketPacket::decode(&body).ok(),
        _ => None,
    }
}
