use bson::{Bson, Document};
use mongodb::error::ErrorKind;
use mongoproxy_wire::CommandError;

/// Errors raised while talking to the backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend answered with `ok: 0`.
    #[error("command failed: {message} (code {code})")]
    Command { code: i32, message: String },

    /// A cursor id the backend does not know.
    #[error("cursor {0} not found")]
    CursorNotFound(i64),

    /// Server selection gave up before any address answered.
    #[error("no reachable backend among [{addresses}]: {reason}")]
    Unreachable { addresses: String, reason: String },

    /// The backend sent something the stage cannot interpret.
    #[error("unexpected backend reply: {0}")]
    Protocol(String),

    #[error(transparent)]
    Driver(#[from] mongodb::error::Error),

    #[error(transparent)]
    Config(#[from] mongoproxy_pipeline::ConfigError),
}

impl BackendError {
    /// Typed error code, when the backend supplied one.
    pub fn code(&self) -> Option<i32> {
        match self {
            BackendError::Command { code, .. } => Some(*code),
            BackendError::CursorNotFound(_) => Some(CommandError::CURSOR_NOT_FOUND),
            BackendError::Driver(error) => match error.kind.as_ref() {
                ErrorKind::Command(failure) => Some(failure.code),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.code() == Some(CommandError::CURSOR_NOT_FOUND)
    }

    /// The error as clients see it. Untyped failures become `UnknownError`.
    pub fn to_command_error(&self) -> CommandError {
        match self {
            BackendError::Command { code, message } => CommandError::new(*code, message.clone()),
            BackendError::Driver(error) => match error.kind.as_ref() {
                ErrorKind::Command(failure) => {
                    CommandError::new(failure.code, failure.message.clone())
                }
                _ => CommandError::new(CommandError::UNKNOWN_ERROR, error.to_string()),
            },
            other => CommandError::new(
                other.code().unwrap_or(CommandError::UNKNOWN_ERROR),
                other.to_string(),
            ),
        }
    }

    /// `Some` when `reply` carries a false or zero `ok`.
    pub fn from_reply(reply: &Document) -> Option<Self> {
        if reply_ok(reply) {
            return None;
        }
        let code = match reply.get("code") {
            Some(Bson::Int32(code)) => *code,
            Some(Bson::Int64(code)) => *code as i32,
            Some(Bson::Double(code)) => *code as i32,
            _ => CommandError::UNKNOWN_ERROR,
        };
        let message = reply
            .get_str("errmsg")
            .or_else(|_| reply.get_str("$err"))
            .unwrap_or("command failed")
            .to_string();
        Some(BackendError::Command { code, message })
    }
}

/// Reads the `ok` field the way servers write it: double, integer or bool.
pub fn reply_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(ok)) => *ok != 0.0,
        Some(Bson::Int32(ok)) => *ok != 0,
        Some(Bson::Int64(ok)) => *ok != 0,
        Some(Bson::Boolean(ok)) => *ok,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
