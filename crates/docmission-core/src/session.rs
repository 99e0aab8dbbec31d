//! Mission session facade
//!
//! The one object a UI talks to. It owns the transport for its whole
//! lifetime, turns transport callbacks into queued inputs, and applies them
//! to the mission state machine one at a time.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{LaunchError, ProtocolError, TransportError};
use crate::mission::{MissionChange, MissionInput, MissionMachine};
use crate::protocol::{
    ServerEvent, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_FINAL_RESULT, EVENT_LOG,
    EVENT_MALFORMED_FRAME,
};
use crate::transport::{InboundEvent, TransportAdapter, TransportOptions};
use crate::types::{ConnectionStatus, FinalDocument, LogEntry, MissionReport, MissionStatus};

/// What applying one queued input changed
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Connection { status: ConnectionStatus, epoch: u64 },
    Mission(MissionChange),
}

/// An inbound event stamped with its receipt time
#[derive(Debug)]
struct Queued {
    event: InboundEvent,
    received_at: DateTime<Utc>,
}

/// Mission session facade
pub struct MissionSession {
    transport: TransportAdapter,
    machine: MissionMachine,
    inbox: mpsc::UnboundedReceiver<Queued>,
    /// Updates applied by `start` that the caller has not seen yet
    pending: Vec<SessionUpdate>,
}

impl MissionSession {
    /// Create a session with its own (not yet connected) transport
    pub fn new(options: TransportOptions) -> Self {
        let transport = TransportAdapter::new(options);
        let (tx, inbox) = mpsc::unbounded_channel();

        for event in [
            EVENT_CONNECT,
            EVENT_DISCONNECT,
            EVENT_LOG,
            EVENT_FINAL_RESULT,
            EVENT_MALFORMED_FRAME,
        ] {
            let tx = tx.clone();
            transport.on(event, move |inbound| {
                let _ = tx.send(Queued {
                    event: inbound.clone(),
                    received_at: Utc::now(),
                });
            });
        }

        Self {
            transport,
            machine: MissionMachine::new(),
            inbox,
            pending: Vec::new(),
        }
    }

    /// Start connecting to the agent server (see `TransportAdapter::connect`)
    pub fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        self.transport.connect(endpoint)
    }

    pub async fn wait_for_connection(&self, limit: Duration) -> bool {
        self.transport.wait_for_connection(limit).await
    }

    /// Tear down the connection and apply the resulting inputs
    pub fn disconnect(&mut self) -> Vec<SessionUpdate> {
        self.transport.disconnect();
        self.drain()
    }

    // ============ Views ============

    pub fn logs(&self) -> &[LogEntry] {
        self.machine.logs()
    }

    pub fn document(&self) -> Option<&FinalDocument> {
        self.machine.document()
    }

    pub fn report(&self) -> Option<&MissionReport> {
        self.machine.report()
    }

    pub fn mission_status(&self) -> MissionStatus {
        self.machine.status()
    }

    pub fn project_path(&self) -> Option<&str> {
        self.machine.project_path()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether `start(path)` would currently be accepted
    ///
    /// This is the only launch gate a UI should rely on.
    pub fn can_launch(&self, path: Option<&str>) -> bool {
        self.is_connected()
            && self.machine.status().accepts_start()
            && path.is_some_and(|p| !p.trim().is_empty())
    }

    // ============ Commands ============

    /// Start a mission on `path`
    ///
    /// Inputs already queued are applied first, so nothing from an earlier
    /// mission can land in the new one. The updates they cause are held
    /// back and returned by the next `drain` or `next_update`.
    pub fn start(&mut self, path: &str) -> Result<(), LaunchError> {
        let earlier = self.drain();
        self.pending.extend(earlier);

        let connection = self.transport.status();
        let epoch = self.transport.epoch();
        let transport = &self.transport;
        self.machine.start(path, connection, epoch, |event| {
            let payload = event.payload()?;
            transport.send(event.name(), payload)
        })
    }

    /// Wait for the next inbound input and apply it
    ///
    /// Returns `None` once the transport is stopped (never connected, or
    /// disconnected) and nothing is left to apply.
    pub async fn next_update(&mut self) -> Option<Vec<SessionUpdate>> {
        if !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        let queued = if self.transport.is_running() {
            self.inbox.recv().await?
        } else {
            self.inbox.try_recv().ok()?
        };
        Some(self.apply(queued))
    }

    /// Apply every input already queued, without waiting
    pub fn drain(&mut self) -> Vec<SessionUpdate> {
        let mut updates = std::mem::take(&mut self.pending);
        while let Ok(queued) = self.inbox.try_recv() {
            updates.extend(self.apply(queued));
        }
        updates
    }

    fn apply(&mut self, queued: Queued) -> Vec<SessionUpdate> {
        let Queued { event, received_at } = queued;
        let epoch = event.epoch;

        let input = match event.name.as_str() {
            EVENT_CONNECT => {
                return vec![SessionUpdate::Connection {
                    status: ConnectionStatus::Connected,
                    epoch,
                }];
            }
            EVENT_DISCONNECT => {
                let mut updates = vec![SessionUpdate::Connection {
                    status: ConnectionStatus::Disconnected,
                    epoch,
                }];
                updates.extend(self.mission(MissionInput::Disconnected { epoch }));
                return updates;
            }
            EVENT_MALFORMED_FRAME => {
                let reason = event.payload["reason"]
                    .as_str()
                    .unwrap_or("undecodable frame")
                    .to_string();
                MissionInput::Malformed {
                    error: ProtocolError::MalformedFrame(reason),
                    epoch,
                }
            }
            name => match ServerEvent::decode(name, &event.payload) {
                Ok(Some(ServerEvent::Log(payload))) => MissionInput::Log {
                    payload,
                    received_at,
                    epoch,
                },
                Ok(Some(ServerEvent::FinalResult(payload))) => {
                    MissionInput::FinalResult { payload, epoch }
                }
                Ok(None) => {
                    debug!(event = %name, "Unhandled server event");
                    return Vec::new();
                }
                Err(error) => MissionInput::Malformed { error, epoch },
            },
        };

        self.mission(input)
    }

    fn mission(&mut self, input: MissionInput) -> Vec<SessionUpdate> {
        self.machine
            .apply(input)
            .into_iter()
            .map(SessionUpdate::Mission)
            .collect()
    }
}

impl Drop for MissionSession {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::{CONNECTION_LOST_MESSAGE, MISSION_COMPLETE_MESSAGE};
    use crate::protocol::EVENT_START_AGENT;
    use crate::test_support::{TestAgentServer, TestConnection};
    use crate::transport::ReconnectPolicy;
    use crate::types::LogLevel;
    use serde_json::json;
    use tokio::time::{sleep, timeout};

    fn test_options() -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy::fixed(Duration::from_millis(50)),
        }
    }

    async fn connected_session(server: &mut TestAgentServer) -> (MissionSession, TestConnection) {
        let mut session = MissionSession::new(test_options());
        session.connect(server.url()).unwrap();
        let conn = server.accept().await;
        assert!(session.wait_for_connection(Duration::from_secs(2)).await);
        (session, conn)
    }

    /// Apply inputs until `done` holds
    async fn pump_until(session: &mut MissionSession, done: impl Fn(&MissionSession) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done(session) {
                session.next_update().await.expect("transport gone");
            }
        })
        .await
        .expect("session did not reach the expected state");
    }

    #[tokio::test]
    async fn test_full_mission() {
        let mut server = TestAgentServer::start().await;
        let (mut session, mut conn) = connected_session(&mut server).await;

        assert!(session.can_launch(Some("/repo")));
        session.start("/repo").unwrap();
        assert_eq!(session.mission_status(), MissionStatus::Awaiting);
        assert!(!session.can_launch(Some("/repo")));

        let (name, data) = conn.recv().await;
        assert_eq!(name, EVENT_START_AGENT);
        assert_eq!(data, json!({ "project_path": "/repo" }));

        conn.emit(EVENT_LOG, json!({ "level": "INFO", "message": "scanning" })).await;
        conn.emit(EVENT_LOG, json!({ "level": "WARNING", "message": "missing tests" })).await;
        conn.emit(EVENT_FINAL_RESULT, json!({ "documentation": "# Report\n..." })).await;

        pump_until(&mut session, |s| s.mission_status() == MissionStatus::Completed).await;

        assert_eq!(session.logs().len(), 3);
        assert_eq!(session.logs()[0].message, "scanning");
        assert_eq!(session.logs()[1].level, LogLevel::Warning);
        assert_eq!(session.logs()[2].level, LogLevel::Success);
        assert_eq!(session.document().unwrap().content, "# Report\n...");
        assert!(session.can_launch(Some("/repo")));
    }

    #[tokio::test]
    async fn test_start_while_disconnected() {
        let mut session = MissionSession::new(test_options());

        assert!(!session.can_launch(Some("/repo")));
        let err = session.start("/repo").unwrap_err();
        assert!(matches!(err, LaunchError::NotConnected));
        assert_eq!(session.mission_status(), MissionStatus::Idle);
        assert!(session.logs().is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut server = TestAgentServer::start().await;
        let (mut session, mut conn) = connected_session(&mut server).await;

        session.start("/repo").unwrap();
        let err = session.start("/other").unwrap_err();
        assert!(matches!(err, LaunchError::MissionInFlight));
        assert_eq!(session.project_path(), Some("/repo"));

        // Only one start_agent went out
        assert_eq!(conn.recv().await.1["project_path"], "/repo");
        conn.emit(EVENT_FINAL_RESULT, json!({ "documentation": "done" })).await;
        pump_until(&mut session, |s| s.mission_status() == MissionStatus::Completed).await;
        assert_eq!(session.document().unwrap().content, "done");
    }

    #[tokio::test]
    async fn test_server_drop_fails_mission() {
        let mut server = TestAgentServer::start().await;
        let (mut session, mut conn) = connected_session(&mut server).await;

        session.start("/repo").unwrap();
        conn.recv().await;
        conn.close().await;

        pump_until(&mut session, |s| s.mission_status() == MissionStatus::Failed).await;

        let errors: Vec<&LogEntry> = session
            .logs()
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, CONNECTION_LOST_MESSAGE);
        assert!(session.document().is_none());

        // The transport comes back on its own; the mission stays Failed
        let _conn = server.accept().await;
        assert!(session.wait_for_connection(Duration::from_secs(2)).await);
        pump_until(&mut session, |s| s.is_connected()).await;
        session.drain();
        assert_eq!(session.mission_status(), MissionStatus::Failed);
    }

    #[tokio::test]
    async fn test_disconnect_fails_mission() {
        let mut server = TestAgentServer::start().await;
        let (mut session, _conn) = connected_session(&mut server).await;

        session.start("/repo").unwrap();
        let updates = session.disconnect();

        assert!(updates.contains(&SessionUpdate::Connection {
            status: ConnectionStatus::Disconnected,
            epoch: 1,
        }));
        assert_eq!(session.mission_status(), MissionStatus::Failed);
        assert_eq!(session.logs().len(), 1);
        assert!(session.document().is_none());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_restart_clears_previous_mission() {
        let mut server = TestAgentServer::start().await;
        let (mut session, mut conn) = connected_session(&mut server).await;

        session.start("/a").unwrap();
        conn.recv().await;
        conn.emit(EVENT_LOG, json!({ "level": "INFO", "message": "a" })).await;
        conn.emit(EVENT_FINAL_RESULT, json!({ "documentation": "doc a" })).await;
        pump_until(&mut session, |s| s.mission_status() == MissionStatus::Completed).await;

        session.start("/b").unwrap();
        assert!(session.logs().is_empty());
        assert!(session.document().is_none());
        assert_eq!(conn.recv().await.1["project_path"], "/b");

        conn.emit(EVENT_LOG, json!({ "level": "INFO", "message": "b" })).await;
        pump_until(&mut session, |s| !s.logs().is_empty()).await;
        assert_eq!(session.logs().len(), 1);
        assert_eq!(session.logs()[0].message, "b");
    }

    #[tokio::test]
    async fn test_malformed_payload_degrades_to_warning() {
        let mut server = TestAgentServer::start().await;
        let (mut session, mut conn) = connected_session(&mut server).await;

        session.start("/repo").unwrap();
        conn.recv().await;
        conn.emit(EVENT_LOG, json!({ "level": "INFO" })).await;
        conn.send_raw("garbage").await;
        conn.emit(EVENT_LOG, json!({ "level": "custom", "message": "still here" })).await;

        pump_until(&mut session, |s| s.logs().len() == 3).await;

        assert_eq!(session.logs()[0].level, LogLevel::Warning);
        assert!(session.logs()[0].synthetic);
        assert_eq!(session.logs()[1].level, LogLevel::Warning);
        assert_eq!(session.logs()[2].level, LogLevel::Other("custom".to_string()));
        assert_eq!(session.mission_status(), MissionStatus::Awaiting);
    }

    #[tokio::test]
    async fn test_can_launch_needs_a_path() {
        let mut server = TestAgentServer::start().await;
        let (session, _conn) = connected_session(&mut server).await;

        assert!(!session.can_launch(None));
        assert!(!session.can_launch(Some("")));
        assert!(!session.can_launch(Some("  ")));
        assert!(session.can_launch(Some("/repo")));
    }

    #[tokio::test]
    async fn test_next_update_ends_after_disconnect() {
        let mut server = TestAgentServer::start().await;
        let (mut session, _conn) = connected_session(&mut server).await;

        session.disconnect();
        let ended = timeout(Duration::from_secs(1), session.next_update()).await;
        assert_eq!(ended.unwrap(), None);

        // A session that never connected has nothing to wait for either
        let mut idle = MissionSession::new(test_options());
        let ended = timeout(Duration::from_secs(1), idle.next_update()).await;
        assert_eq!(ended.unwrap(), None);
    }

    #[tokio::test]
    async fn test_start_keeps_earlier_updates() {
        let mut server = TestAgentServer::start().await;
        let (mut session, mut conn) = connected_session(&mut server).await;

        session.start("/a").unwrap();
        conn.recv().await;
        conn.emit(EVENT_LOG, json!({ "level": "INFO", "message": "late line" })).await;
        conn.emit(EVENT_FINAL_RESULT, json!({ "documentation": "doc a" })).await;
        // Starting again right away applies both inputs inside `start`
        sleep(Duration::from_millis(100)).await;
        session.start("/b").unwrap();

        let updates = session.drain();
        let messages: Vec<&str> = updates
            .iter()
            .filter_map(|u| match u {
                SessionUpdate::Mission(MissionChange::LogAppended(entry)) => {
                    Some(entry.message.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(messages, vec!["late line", MISSION_COMPLETE_MESSAGE]);
        assert!(updates.contains(&SessionUpdate::Mission(MissionChange::StatusChanged {
            from: MissionStatus::Awaiting,
            to: MissionStatus::Completed,
        })));

        // Held-back updates are handed out once
        assert!(session.drain().is_empty());
        assert_eq!(session.mission_status(), MissionStatus::Awaiting);
        assert!(session.logs().is_empty());
    }
}
