use serde_json::json;
use shared::{
    domain::{Role, SessionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::MessageType,
};
use thiserror::Error;

use crate::{
    fanout::FanoutReport,
    state_machine::{MachineEvent, MachineState},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("current state({state}) cannot invoke {event}")]
pub struct TransitionError {
    pub state: MachineState,
    pub event: MachineEvent,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no messaging transport configured")]
    NoTransports,
    #[error("please set config first")]
    MissingConfig,
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("{0}")]
    Fanout(FanoutReport),
    #[error("primary transport {kind} failed: {message}")]
    Primary { kind: String, message: String },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Contract violations raised by the cooperation and interaction managers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("role {role} cannot perform {action}")]
    RoleActionMismatch { role: Role, action: &'static str },
    #[error("{message_type} conflicts with current state {}", describe_state(.state))]
    StateActionMismatch {
        message_type: MessageType,
        state: Option<MachineState>,
        receiver: Option<UserId>,
    },
    #[error("{handler}: no pending session {session_id}")]
    SessionMissed {
        handler: &'static str,
        session_id: SessionId,
        /// The id belonged to a session that already completed.
        expired: bool,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

fn describe_state(state: &Option<MachineState>) -> String {
    match state {
        Some(state) => state.to_string(),
        None => "none".to_string(),
    }
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::RoleActionMismatch { .. } => ErrorCode::RoleActionMismatch,
            ProtocolError::StateActionMismatch { .. } => ErrorCode::StateActionMismatch,
            ProtocolError::SessionMissed { .. } => ErrorCode::SessionMissed,
            ProtocolError::Transition(_) => ErrorCode::StateActionMismatch,
            ProtocolError::Router(RouterError::Validation(_)) | ProtocolError::Payload(_) => {
                ErrorCode::Validation
            }
            ProtocolError::Router(_) => ErrorCode::Transport,
        }
    }

    /// A late or duplicated reply for a session that already finished.
    pub fn is_stale_reply(&self) -> bool {
        matches!(self, ProtocolError::SessionMissed { expired: true, .. })
    }

    pub fn to_api_error(&self) -> ApiError {
        let error = ApiError::new(self.code(), self.to_string());
        match self {
            ProtocolError::RoleActionMismatch { role, action } => {
                error.with_args(json!({ "role": role, "action": action }))
            }
            ProtocolError::StateActionMismatch {
                message_type,
                state,
                receiver,
            } => error.with_args(json!({
                "type": message_type,
                "state": state.map(|state| state.to_string()),
                "receiverId": receiver,
            })),
            ProtocolError::SessionMissed {
                handler,
                session_id,
                ..
            } => error.with_args(json!({ "handler": handler, "sessionId": session_id })),
            _ => error,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
