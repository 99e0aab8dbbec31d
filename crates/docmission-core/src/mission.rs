//! Mission state machine
//!
//! `transition` is the pure status table; `MissionMachine` layers the log
//! feed and the latched result on top of it. Nothing here touches the network,
//! so every transition can be driven directly from tests.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{LaunchError, ProtocolError, TransportError};
use crate::protocol::{ClientEvent, FinalResultPayload, LogPayload};
use crate::types::{
    ConnectionStatus, FinalDocument, LogEntry, LogLevel, MissionReport, MissionStatus,
};

pub const MISSION_COMPLETE_MESSAGE: &str = "Mission complete! Final documentation received.";
pub const CONNECTION_LOST_MESSAGE: &str =
    "Connection to the agent server was lost before the mission finished.";

/// Status-level view of what happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionEvent {
    Start,
    Log,
    FinalResult,
    TransportLost,
}

/// Next status for `event` in `status`, or `None` when the event does not apply
pub fn transition(status: MissionStatus, event: MissionEvent) -> Option<MissionStatus> {
    use MissionEvent::*;
    use MissionStatus::*;

    match (status, event) {
        (Idle | Completed | Failed, Start) => Some(Awaiting),
        (Awaiting, Log) => Some(Awaiting),
        (Awaiting, FinalResult) => Some(Completed),
        (Awaiting, TransportLost) => Some(Failed),
        _ => None,
    }
}

/// Inbound inputs, already decoded and tagged with their connection epoch
#[derive(Debug, Clone, PartialEq)]
pub enum MissionInput {
    Log {
        payload: LogPayload,
        received_at: DateTime<Utc>,
        epoch: u64,
    },
    FinalResult {
        payload: FinalResultPayload,
        epoch: u64,
    },
    Malformed {
        error: ProtocolError,
        epoch: u64,
    },
    Disconnected {
        epoch: u64,
    },
}

/// Observable effect of applying one input
#[derive(Debug, Clone, PartialEq)]
pub enum MissionChange {
    LogAppended(LogEntry),
    StatusChanged {
        from: MissionStatus,
        to: MissionStatus,
    },
}

/// Mission state: status, ordered log feed, latched document
#[derive(Debug, Default)]
pub struct MissionMachine {
    status: MissionStatus,
    logs: Vec<LogEntry>,
    document: Option<FinalDocument>,
    report: Option<MissionReport>,
    project_path: Option<String>,
    /// Connection epoch the current mission was started on
    mission_epoch: u64,
}

impl MissionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> MissionStatus {
        self.status
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Present only once the mission completed
    pub fn document(&self) -> Option<&FinalDocument> {
        self.document.as_ref()
    }

    pub fn report(&self) -> Option<&MissionReport> {
        self.report.as_ref()
    }

    pub fn project_path(&self) -> Option<&str> {
        self.project_path.as_deref()
    }

    pub fn mission_epoch(&self) -> u64 {
        self.mission_epoch
    }

    /// Validate the start preconditions without changing anything
    pub fn check_start(&self, path: &str, connection: ConnectionStatus) -> Result<(), LaunchError> {
        if path.trim().is_empty() {
            return Err(LaunchError::NoProjectPath);
        }
        if !connection.is_connected() {
            return Err(LaunchError::NotConnected);
        }
        if transition(self.status, MissionEvent::Start).is_none() {
            return Err(LaunchError::MissionInFlight);
        }
        Ok(())
    }

    /// Start a mission on `path`
    ///
    /// `emit` delivers the `start_agent` event. State is only reset once it
    /// succeeds, so every rejection leaves the machine untouched.
    pub fn start<F>(
        &mut self,
        path: &str,
        connection: ConnectionStatus,
        epoch: u64,
        emit: F,
    ) -> Result<(), LaunchError>
    where
        F: FnOnce(&ClientEvent) -> Result<(), TransportError>,
    {
        self.check_start(path, connection)?;

        let event = ClientEvent::StartAgent {
            project_path: path.to_string(),
        };
        emit(&event)?;

        self.logs.clear();
        self.document = None;
        self.report = None;
        self.project_path = Some(path.to_string());
        self.mission_epoch = epoch;
        self.status = MissionStatus::Awaiting;

        info!(project_path = %path, epoch, "Mission started");
        Ok(())
    }

    /// Apply one inbound input, returning what changed
    pub fn apply(&mut self, input: MissionInput) -> Vec<MissionChange> {
        match input {
            MissionInput::Log {
                payload,
                received_at,
                epoch,
            } => {
                if !self.accepts(MissionEvent::Log, epoch) {
                    debug!(status = %self.status, epoch, "Ignoring log outside a mission");
                    return Vec::new();
                }
                let level = payload.level();
                vec![self.append(LogEntry::received(level, payload.message, received_at))]
            }

            MissionInput::FinalResult { payload, epoch } => {
                if !self.accepts(MissionEvent::FinalResult, epoch) {
                    debug!(status = %self.status, epoch, "Ignoring final_result outside a mission");
                    return Vec::new();
                }
                info!(
                    bytes = payload.documentation.len(),
                    has_report = payload.report.is_some(),
                    "Mission completed"
                );
                self.document = Some(FinalDocument::new(payload.documentation));
                self.report = payload.report;
                let appended = self.append(LogEntry::synthetic(
                    LogLevel::Success,
                    MISSION_COMPLETE_MESSAGE,
                ));
                vec![appended, self.set_status(MissionStatus::Completed)]
            }

            MissionInput::Malformed { error, epoch } => {
                if self.status != MissionStatus::Awaiting || epoch != self.mission_epoch {
                    warn!(error = %error, "Dropped malformed message outside a mission");
                    return Vec::new();
                }
                warn!(error = %error, "Dropped malformed message");
                vec![self.append(LogEntry::synthetic(
                    LogLevel::Warning,
                    format!("Dropped malformed message from the agent server: {}", error),
                ))]
            }

            MissionInput::Disconnected { epoch } => {
                if !self.accepts(MissionEvent::TransportLost, epoch) {
                    return Vec::new();
                }
                warn!(epoch, project_path = ?self.project_path, "Mission failed: connection lost");
                let appended =
                    self.append(LogEntry::synthetic(LogLevel::Error, CONNECTION_LOST_MESSAGE));
                vec![appended, self.set_status(MissionStatus::Failed)]
            }
        }
    }

    /// Inputs only count for the connection the mission was started on
    fn accepts(&self, event: MissionEvent, epoch: u64) -> bool {
        transition(self.status, event).is_some() && epoch == self.mission_epoch
    }

    fn append(&mut self, entry: LogEntry) -> MissionChange {
        self.logs.push(entry.clone());
        MissionChange::LogAppended(entry)
    }

    fn set_status(&mut self, to: MissionStatus) -> MissionChange {
        let from = self.status;
        self.status = to;
        MissionChange::StatusChanged { from, to }
    }
}
