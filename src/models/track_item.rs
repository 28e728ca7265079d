use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Color used by synthesized gap segments in a reconstructed timeline.
pub const TRANSPARENT: &str = "transparent";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    App,
    Status,
    Log,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::App => "app",
            ActivityKind::Status => "status",
            ActivityKind::Log => "log",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identities carried by `ActivityKind::Status` items.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Online,
    Offline,
    Idle,
    LogOn,
    LogOff,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Online => "ONLINE",
            Status::Offline => "OFFLINE",
            Status::Idle => "IDLE",
            Status::LogOn => "LOG_ON",
            Status::LogOff => "LOG_OFF",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted activity interval. `id` is `None` until the store assigns
/// a rowid on insert. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackItem {
    pub id: Option<i64>,
    pub kind: ActivityKind,
    pub identity: String,
    pub begin_date: i64,
    pub end_date: i64,
    pub color: Option<String>,
}

impl TrackItem {
    pub fn duration_ms(&self) -> i64 {
        self.end_date - self.begin_date
    }

    /// Closed-interval intersection test against `[from, to]`.
    pub fn intersects(&self, from: i64, to: i64) -> bool {
        self.begin_date <= to && self.end_date >= from
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.begin_date > self.end_date {
            return Err(EngineError::InvalidInterval {
                begin: self.begin_date,
                end: self.end_date,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryWindow {
    pub from: i64,
    pub to: i64,
}

impl QueryWindow {
    pub fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.from > self.to {
            return Err(EngineError::InvalidWindow {
                from: self.from,
                to: self.to,
            });
        }
        Ok(())
    }
}

/// One chart-ready slice of a reconstructed timeline. `diff` is the span
/// in whole minutes; `x` is the zero-based ordinal within the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub begin_date: i64,
    pub end_date: i64,
    pub diff: i64,
    pub color: Option<String>,
    pub x: u32,
}

impl Segment {
    pub fn is_gap(&self) -> bool {
        self.color.as_deref() == Some(TRANSPARENT)
    }
}
