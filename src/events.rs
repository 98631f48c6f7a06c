//! Wire shapes of the `text/event-stream` protocol.
//!
//! Every frame is a single `data: <payload>` line followed by a blank line.
//! Code streams carry [`StreamEvent`] payloads, chat streams carry
//! [`ChatEvent`] payloads, and both end with the `[DONE]` sentinel.

use serde::{Deserialize, Serialize};

use crate::models::GeneratedProject;

/// Payload of the frame that closes every stream.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Raw model fragment, verbatim and in arrival order.
    Chunk(String),
    /// Terminal success carrying the parsed project.
    Done(GeneratedProject),
    /// Terminal failure.
    Error(String),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StreamWire {
    Done {
        done: bool,
        #[serde(flatten)]
        project: GeneratedProject,
    },
    Chunk {
        chunk: String,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Chunk(_))
    }

    pub fn to_data(&self) -> String {
        let wire = match self.clone() {
            Self::Chunk(chunk) => StreamWire::Chunk { chunk },
            Self::Done(project) => StreamWire::Done {
                done: true,
                project,
            },
            Self::Error(error) => StreamWire::Error { error },
        };
        // Only strings and plain structs; serialization cannot fail.
        serde_json::to_string(&wire).unwrap_or_else(|_| r#"{"error":"serialization"}"#.to_string())
    }

    pub fn from_data(data: &str) -> Result<Self, serde_json::Error> {
        let wire: StreamWire = serde_json::from_str(data)?;
        Ok(match wire {
            StreamWire::Done { done: true, project } => Self::Done(project),
            StreamWire::Done { done: false, .. } => {
                return Err(serde::de::Error::custom("done flag must be true"));
            }
            StreamWire::Chunk { chunk } => Self::Chunk(chunk),
            StreamWire::Error { error } => Self::Error(error),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatEvent {
    Content { content: String },
    Error { error: String },
}

impl ChatEvent {
    pub fn content(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn to_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"serialization"}"#.to_string())
    }
}

/// Formats one frame exactly as it appears on the wire.
pub fn frame(data: &str) -> String {
    format!("data: {}\n\n", data)
}
