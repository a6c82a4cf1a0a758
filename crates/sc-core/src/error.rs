//! Unified error type for slidecast.
//!
//! All crates funnel their failures into [`Error`]. Capability invocations
//! report a lighter [`CapabilityFailure`] value instead, which the stage
//! executor absorbs into segment status; only stage exhaustion, composition
//! failure, cancellation, and ingest validation end a run.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::stage::Stage;

/// Whether a failed capability invocation may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Network or availability problem; retry, then fall back.
    Transient,
    /// Bad input or unsupported parameters; fall back immediately.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure returned by a single capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFailure {
    pub kind: FailureKind,
    pub cause: String,
}

impl CapabilityFailure {
    pub fn transient(cause: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            cause: cause.into(),
        }
    }

    pub fn permanent(cause: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            cause: cause.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

impl fmt::Display for CapabilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.cause)
    }
}

impl std::error::Error for CapabilityFailure {}

/// Unified error type covering all failure modes in slidecast.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe, etc.) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Media probing failed.
    #[error("Probe error: {0}")]
    Probe(String),

    /// A capability invocation failed.
    #[error("Capability error [{capability}] ({kind}): {message}")]
    Capability {
        capability: String,
        kind: FailureKind,
        message: String,
    },

    /// A segment lost every capability for a mandatory stage.
    #[error("Segment {index} lost at {stage}: {cause}")]
    SegmentLoss {
        stage: Stage,
        index: u32,
        cause: String,
    },

    /// No segment survived a mandatory stage.
    #[error("Stage exhausted [{stage}]: {cause}")]
    StageExhaustion { stage: Stage, cause: String },

    /// Rendered clips do not share encoding parameters.
    #[error("Clip {index} parameters diverge: expected {expected}, found {found}")]
    CompositionMismatch {
        index: u32,
        expected: String,
        found: String,
    },

    /// Both concatenation paths failed.
    #[error("Composition failed: fast path: {fast}; fallback path: {fallback}")]
    Composition { fast: String, fallback: String },

    /// The run was cancelled by the caller.
    #[error("Run cancelled")]
    Cancelled,

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error ends the whole run.
    pub fn is_run_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Capability { .. } | Error::SegmentLoss { .. } | Error::CompositionMismatch { .. }
        )
    }

    /// The stage this error is attributed to, when known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::SegmentLoss { stage, .. } | Error::StageExhaustion { stage, .. } => Some(*stage),
            Error::CompositionMismatch { .. } | Error::Composition { .. } => Some(Stage::Compose),
            _ => None,
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::StageExhaustion`].
    pub fn exhausted(stage: Stage, cause: impl Into<String>) -> Self {
        Error::StageExhaustion {
            stage,
            cause: cause.into(),
        }
    }

    /// Wrap a capability failure with the name of the capability.
    pub fn capability(capability: impl Into<String>, failure: CapabilityFailure) -> Self {
        Error::Capability {
            capability: capability.into(),
            kind: failure.kind,
            message: failure.cause,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
