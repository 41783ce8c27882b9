//! JSON message protocol spoken over the session socket.
//!
//! Every frame is a single externally tagged JSON object:
//! ```text
//! client → server   {"Edit":{"revision":5,"operation":[3,"X"]}}
//! server → client   {"Edit":{"id":2,"revision":5,"operation":[3,"X"]}}
//! ```
//!
//! The server is the sole sequencer. Each accepted edit is broadcast to every
//! participant, including its originator, which doubles as the
//! acknowledgement.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::Operation;

/// Display identity of a participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    /// Hue in degrees, `0..360`.
    pub hue: u32,
}

impl UserInfo {
    pub fn new(name: impl Into<String>, hue: u32) -> Self {
        Self {
            name: name.into(),
            hue: hue % 360,
        }
    }

    /// Create with a random hue.
    pub fn with_random_hue(name: impl Into<String>) -> Self {
        Self::new(name, random_hue())
    }

    /// RGBA display color derived from the hue.
    pub fn color(&self) -> [f32; 4] {
        let (r, g, b) = hsl_to_rgb(self.hue as f32 / 360.0, 0.9, 0.7);
        [r, g, b, 1.0]
    }
}

/// A hue in `0..360` drawn from a v4 uuid.
pub fn random_hue() -> u32 {
    (uuid::Uuid::new_v4().as_u128() % 360) as u32
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Cursor and selection offsets of one participant, in UTF-16 units.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CursorData {
    pub cursors: Vec<usize>,
    pub selections: Vec<(usize, usize)>,
}

impl CursorData {
    /// Map every offset through an applied operation.
    pub fn transform(&mut self, op: &Operation) {
        for cursor in &mut self.cursors {
            *cursor = op.transform_index(*cursor);
        }
        for (start, end) in &mut self.selections {
            *start = op.transform_index(*start);
            *end = op.transform_index(*end);
        }
    }
}

/// An accepted operation together with its originator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserOperation {
    pub id: u64,
    pub operation: Operation,
}

/// Messages sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientMsg {
    /// Identity update for the local participant.
    ClientInfo(UserInfo),
    /// Proposed edit against a known base revision.
    Edit { revision: u64, operation: Operation },
    /// Proposed document mode change.
    ChangeLanguage { language: String },
    /// Local cursor and selection positions.
    CursorData(CursorData),
}

/// Messages sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerMsg {
    /// Assigns the local participant id for this connection.
    Identity { id: u64 },
    /// Accepted operations starting at `start_revision`.
    History {
        start_revision: u64,
        operations: Vec<UserOperation>,
    },
    /// Full document state at a revision.
    Snapshot { revision: u64, text: String },
    /// A single accepted edit; `revision` is its index in the history.
    Edit {
        id: u64,
        revision: u64,
        operation: Operation,
    },
    /// A participant joined or changed their identity.
    UserInfo { id: u64, name: String, hue: u32 },
    UserLeft { id: u64 },
    LanguageChanged { language: String },
    UserCursor { id: u64, data: CursorData },
}

impl ClientMsg {
    pub fn edit(revision: u64, operation: Operation) -> Self {
        Self::Edit { revision, operation }
    }

    pub fn change_language(language: impl Into<String>) -> Self {
        Self::ChangeLanguage {
            language: language.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMsg {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
