use serde::{Deserialize, Serialize};

use super::track_item::{ActivityKind, Status};

/// One observation of the machine's foreground activity. Samples are
/// ephemeral; only the intervals folded from them are persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp_ms: i64,
    pub kind: ActivityKind,
    /// `None` means the source observed nothing trackable this tick;
    /// the reducer closes any open item of this kind in response.
    pub identity: Option<String>,
}

impl Sample {
    pub fn app(timestamp_ms: i64, identity: impl Into<String>) -> Self {
        Self {
            timestamp_ms,
            kind: ActivityKind::App,
            identity: Some(identity.into()),
        }
    }

    pub fn status(timestamp_ms: i64, status: Status) -> Self {
        Self {
            timestamp_ms,
            kind: ActivityKind::Status,
            identity: Some(status.as_str().to_string()),
        }
    }
}
