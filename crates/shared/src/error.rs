use serde::{Deserialize, Serialize};

/// Wire-stable error codes surfaced to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "roleAndActionMismatch")]
    RoleActionMismatch,
    #[serde(rename = "stateAndActionMismatch")]
    StateActionMismatch,
    #[serde(rename = "sessionMissed")]
    SessionMissed,
    #[serde(rename = "validation")]
    Validation,
    #[serde(rename = "transport")]
    Transport,
    #[serde(rename = "internal")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RoleActionMismatch => "roleAndActionMismatch",
            ErrorCode::StateActionMismatch => "stateAndActionMismatch",
            ErrorCode::SessionMissed => "sessionMissed",
            ErrorCode::Validation => "validation",
            ErrorCode::Transport => "transport",
            ErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }
}
