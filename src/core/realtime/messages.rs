//! Wire message types.
//!
//! Every text frame is a JSON object with a mandatory `type` discriminator.
//! Audio never travels inside these messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::{ClientError, ClientResult};
use crate::core::turn::TurnSignal;

// =============================================================================
// Outbound
// =============================================================================

/// Commands sent from the client to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Ask the agent to stop its current response.
    ClientWantsCancel,
    /// Application-level heartbeat.
    Ping,
    /// Reply to a backend heartbeat.
    Pong,
    /// Typed user input.
    UserText { text: String },
}

impl ClientCommand {
    pub fn event_type(&self) -> &'static str {
        match self {
            ClientCommand::ClientWantsCancel => "client_wants_cancel",
            ClientCommand::Ping => "ping",
            ClientCommand::Pong => "pong",
            ClientCommand::UserText { .. } => "user_text",
        }
    }

    pub fn to_json(&self) -> ClientResult<String> {
        serde_json::to_string(self).map_err(|e| ClientError::SerializationError(e.to_string()))
    }
}

/// Validate and serialize a free-form command object.
pub fn raw_command_json(command: &serde_json::Value) -> ClientResult<String> {
    let object = command.as_object().ok_or_else(|| {
        ClientError::SerializationError("command must be a JSON object".to_string())
    })?;
    match object.get("type") {
        Some(serde_json::Value::String(t)) if !t.is_empty() => {}
        _ => {
            return Err(ClientError::SerializationError(
                "command requires a non-empty string `type`".to_string(),
            ));
        }
    }
    serde_json::to_string(command).map_err(|e| ClientError::SerializationError(e.to_string()))
}

// =============================================================================
// Inbound
// =============================================================================

/// Discriminator of an inbound event, used as the dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Ping,
    Pong,
    UserTurnStart,
    UserTurnEnd,
    AgentTurnStart,
    AgentTurnEnd,
    SessionStarted,
    Transcript,
    AgentCancelled,
    Error,
    Other(String),
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "ping" => EventKind::Ping,
            "pong" => EventKind::Pong,
            "user_turn_start" => EventKind::UserTurnStart,
            "user_turn_end" => EventKind::UserTurnEnd,
            "agent_turn_start" => EventKind::AgentTurnStart,
            "agent_turn_end" => EventKind::AgentTurnEnd,
            "session_started" => EventKind::SessionStarted,
            "transcript" => EventKind::Transcript,
            "agent_cancelled" => EventKind::AgentCancelled,
            "error" => EventKind::Error,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
            EventKind::UserTurnStart => "user_turn_start",
            EventKind::UserTurnEnd => "user_turn_end",
            EventKind::AgentTurnStart => "agent_turn_start",
            EventKind::AgentTurnEnd => "agent_turn_end",
            EventKind::SessionStarted => "session_started",
            EventKind::Transcript => "transcript",
            EventKind::AgentCancelled => "agent_cancelled",
            EventKind::Error => "error",
            EventKind::Other(other) => other,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speaker of a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptRole {
    User,
    #[serde(alias = "assistant")]
    Agent,
}

/// Events received from the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ping,
    Pong,
    UserTurnStart,
    UserTurnEnd,
    AgentTurnStart,
    AgentTurnEnd,
    SessionStarted {
        session_id: String,
    },
    Transcript {
        role: TranscriptRole,
        text: String,
        #[serde(default)]
        is_final: bool,
    },
    AgentCancelled,
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    /// Any event type this client has no typed shape for.
    #[serde(skip_deserializing)]
    Other {
        event_type: String,
        payload: serde_json::Value,
    },
}

impl ServerEvent {
    /// Parse a text frame.
    ///
    /// Rejects anything that is not a JSON object with a string `type`.
    /// Unknown types are kept as [`ServerEvent::Other`].
    pub fn parse(text: &str) -> ClientResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ClientError::MessageParseError(format!("invalid JSON: {e}")))?;

        if !value.is_object() {
            return Err(ClientError::MessageParseError(
                "message is not a JSON object".to_string(),
            ));
        }

        let kind = match value.get("type") {
            Some(serde_json::Value::String(t)) => EventKind::from_type(t),
            Some(_) => {
                return Err(ClientError::MessageParseError(
                    "`type` is not a string".to_string(),
                ));
            }
            None => {
                return Err(ClientError::MessageParseError(
                    "missing `type` field".to_string(),
                ));
            }
        };

        match kind {
            EventKind::Other(event_type) => Ok(ServerEvent::Other {
                event_type,
                payload: value,
            }),
            kind => serde_json::from_value(value).map_err(|e| {
                ClientError::MessageParseError(format!("malformed `{kind}` event: {e}"))
            }),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Ping => EventKind::Ping,
            ServerEvent::Pong => EventKind::Pong,
            ServerEvent::UserTurnStart => EventKind::UserTurnStart,
            ServerEvent::UserTurnEnd => EventKind::UserTurnEnd,
            ServerEvent::AgentTurnStart => EventKind::AgentTurnStart,
            ServerEvent::AgentTurnEnd => EventKind::AgentTurnEnd,
            ServerEvent::SessionStarted { .. } => EventKind::SessionStarted,
            ServerEvent::Transcript { .. } => EventKind::Transcript,
            ServerEvent::AgentCancelled => EventKind::AgentCancelled,
            ServerEvent::Error { .. } => EventKind::Error,
            ServerEvent::Other { event_type, .. } => EventKind::Other(event_type.clone()),
        }
    }

    /// Turn signal carried by this event, if any.
    pub fn turn_signal(&self) -> Option<TurnSignal> {
        match self {
            ServerEvent::UserTurnStart => Some(TurnSignal::UserTurnStart),
            ServerEvent::UserTurnEnd => Some(TurnSignal::UserTurnEnd),
            ServerEvent::AgentTurnStart => Some(TurnSignal::AgentTurnStart),
            ServerEvent::AgentTurnEnd => Some(TurnSignal::AgentTurnEnd),
            _ => None,
        }
    }
}
