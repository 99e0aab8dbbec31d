//! Core types for docmission
//!
//! Connection and mission status, the ordered log feed, and the latched result.

use std::fmt;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============ Status ============

/// Transport-level connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Mission status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    #[default]
    Idle,
    /// `start_agent` sent, no terminal event yet
    Awaiting,
    Completed,
    Failed,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Idle => "idle",
            MissionStatus::Awaiting => "awaiting",
            MissionStatus::Completed => "completed",
            MissionStatus::Failed => "failed",
        }
    }

    /// Whether a new mission may be started from this status
    pub fn accepts_start(&self) -> bool {
        !matches!(self, MissionStatus::Awaiting)
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Log Feed ============

/// Log severity tier
///
/// Unrecognized server levels (the agent forwards its stdout as `AGENT`)
/// are kept verbatim in `Other` instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
    Other(String),
}

impl LogLevel {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("INFO") {
            LogLevel::Info
        } else if trimmed.eq_ignore_ascii_case("WARNING") {
            LogLevel::Warning
        } else if trimmed.eq_ignore_ascii_case("ERROR") {
            LogLevel::Error
        } else if trimmed.eq_ignore_ascii_case("SUCCESS") {
            LogLevel::Success
        } else {
            LogLevel::Other(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
            LogLevel::Other(raw) => raw,
        }
    }
}

impl From<String> for LogLevel {
    fn from(raw: String) -> Self {
        LogLevel::parse(&raw)
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.as_str().to_string()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the mission feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub level: LogLevel,
    pub message: String,
    /// Client-observed receipt time
    pub timestamp: DateTime<Utc>,
    /// Generated locally rather than received from the server
    #[serde(default)]
    pub synthetic: bool,
}

impl LogEntry {
    /// Entry for a line received from the server
    pub fn received(level: LogLevel, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            level,
            message: message.into(),
            timestamp,
            synthetic: false,
        }
    }

    /// Entry recording a client-side state machine event
    pub fn synthetic(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
            synthetic: true,
        }
    }
}

// ============ Result ============

/// The generated document returned by a successful mission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalDocument {
    pub content: String,
}

impl FinalDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Write the content verbatim to `path`, creating parent directories
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }
        std::fs::write(path, &self.content)
            .with_context(|| format!("Failed to write document: {}", path.display()))?;
        Ok(())
    }
}

/// Self-evaluation the agent may attach to `final_result`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionReport {
    pub status: String,
    #[serde(default)]
    pub feedback: Vec<String>,
}
