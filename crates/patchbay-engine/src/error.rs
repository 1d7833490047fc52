use std::fmt;
use std::io;

use patchbay_rt::ModuleId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::module::{Direction, PinKind};

/// Structural errors reported to the control side. The graph is left
/// unchanged by whatever produced them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("unknown module type `{0}`")]
    UnknownType(String),
    #[error("module {0} does not exist")]
    UnknownModule(ModuleId),
    #[error("module {0} already exists")]
    DuplicateModule(ModuleId),
    #[error("module {module} has no parameter `{parameter}`")]
    UnknownParameter { module: ModuleId, parameter: String },
    #[error("{direction} channel {channel} out of range on {module} ({available} available)")]
    ChannelOutOfRange {
        module: ModuleId,
        direction: Direction,
        channel: usize,
        available: usize,
    },
    #[error("cannot connect {from:?} output to {to:?} input")]
    IncompatiblePins { from: PinKind, to: PinKind },
    #[error("connection {0} would close a cycle without a delay module")]
    Cycle(String),
    #[error("module {module} failed: {message}")]
    ModuleFailed { module: ModuleId, message: String },
    #[error("event queue of {0} is full")]
    EventQueueFull(ModuleId),
    #[error("engine is draining and accepts no new plans")]
    Draining,
}

/// Failure of a single module outside the real-time path.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModuleError {
    #[error("prepare failed: {0}")]
    Prepare(String),
    #[error("missing resource: {0}")]
    MissingResource(String),
    #[error("invalid state: {0}")]
    State(String),
}

/// Failure raised from `process_block`. Carries only static text so it can
/// be created on the audio thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ProcessError(pub &'static str);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access patch file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode or decode patch: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported patch version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
}

/// A (severity, message) pair shown by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
}

impl Issue {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Same issue, attributed to an enclosing context such as `module #3`.
    pub fn within(self, context: impl fmt::Display) -> Self {
        Self {
            severity: self.severity,
            message: format!("{context}: {}", self.message),
        }
    }
}

impl From<GraphError> for Issue {
    fn from(err: GraphError) -> Self {
        Issue::error(err.to_string())
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{label}: {}", self.message)
    }
}
