//! Error taxonomy for the worker.
//!
//! Four classes with strictly bounded blast radius:
//! - [`ProtocolError`], [`SerializationError`], [`UserCodeError`]: per-task,
//!   reported to the orchestrator, the slot keeps serving.
//! - [`FatalError`]: per-slot, the slot transitions to Stopped and is not
//!   respawned. Other slots continue.

use std::io;

/// Malformed or unresolvable input from the orchestrator.
///
/// All fields on the pipe are untrusted; anything that fails validation ends
/// up here and is answered with an error response, never a slot crash.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed line: {0}")]
    Malformed(String),

    #[error("opcode not recognized: {0}")]
    UnknownOpcode(String),

    #[error("missing field `{field}` for {opcode}")]
    MissingField {
        opcode: &'static str,
        field: &'static str,
    },

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Backing-store or payload codec failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SerializationError {
    #[error("store read failed for `{id}`: {reason}")]
    Read { id: String, reason: String },

    #[error("store write failed for `{id}`: {reason}")]
    Write { id: String, reason: String },

    #[error("undeserializable payload for `{id}`: {reason}")]
    Decode { id: String, reason: String },

    #[error("unserializable value: {reason}")]
    Encode { reason: String },
}

impl SerializationError {
    pub fn read(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Read {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Write {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

/// An error raised inside the invoked task function (including panics).
#[derive(Debug, Clone, thiserror::Error)]
#[error("user code error: {message}")]
pub struct UserCodeError {
    pub message: String,
}

impl UserCodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Unrecoverable slot-level failure. The slot stops; it is not retried locally.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("pipe closed by peer")]
    Eof,

    #[error("pipe error: {0}")]
    Pipe(#[from] io::Error),

    #[error("return message arity mismatch: {types} types, {values} values")]
    ReturnArityMismatch { types: usize, values: usize },

    #[error("pin count underflow for `{0}`")]
    PinUnderflow(String),

    #[error("cache invariant violated: {0}")]
    CacheInvariant(String),
}

/// Tagged per-task failure, consulted against the task's failure policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    UserCode(#[from] UserCodeError),
}

impl TaskFailure {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::UserCode(_) => ExitCode::UserCode,
            Self::Serialization(_) => ExitCode::Serialization,
            Self::Protocol(_) => ExitCode::Protocol,
        }
    }
}

/// Exit status reported after each EXECUTE_TASK. Nonzero encodes the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success,
    UserCode,
    Serialization,
    Protocol,
}

impl ExitCode {
    pub fn code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::UserCode => 1,
            Self::Serialization => 2,
            Self::Protocol => 3,
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}
