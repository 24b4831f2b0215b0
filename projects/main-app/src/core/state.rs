use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Photo,
    Video,
    Stream,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Photo => "Photo",
            Mode::Video => "Video",
            Mode::Stream => "Stream",
        };
        f.write_str(name)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Photo" => Ok(Mode::Photo),
            "Video" => Ok(Mode::Video),
            "Stream" => Ok(Mode::Stream),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Snapshot answered by `CameraControl::status`. Liveness flags are read from
/// the supervisors when the snapshot is taken.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub mode: Mode,
    pub state: ControlState,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub stream_running: bool,
    pub motion_running: bool,
}
