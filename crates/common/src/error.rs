//! Error types shared across the export pipeline crates.

use std::sync::Arc;
use std::time::Duration;

/// Top-level error type for pipeline operations.
///
/// The type is `Clone` so a sticky failure recorded by a background loop
/// can be handed to every waiter blocked on the same component.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Container error: {message}")]
    Container { message: String },

    #[error("Codec unsupported ({codec}): {message}")]
    CodecUnsupported { codec: String, message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Frame {index} not available at {time_ms:.3}ms")]
    FrameNotAvailable { index: u64, time_ms: f64 },

    #[error("Render worker {worker} crashed: {message}")]
    WorkerCrash { worker: usize, message: String },

    #[error("Encode error: {message}")]
    Encode { message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{queue} queue is full")]
    QueueFull { queue: &'static str },

    #[error("{component} is closed")]
    Closed { component: &'static str },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(Arc<std::io::Error>),

    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    #[error(transparent)]
    Other(Arc<anyhow::Error>),
}

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(Arc::new(err))
    }
}

impl PipelineError {
    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container {
            message: msg.into(),
        }
    }

    pub fn codec_unsupported(codec: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CodecUnsupported {
            codec: codec.into(),
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    pub fn worker_crash(worker: usize, msg: impl Into<String>) -> Self {
        Self::WorkerCrash {
            worker,
            message: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether this error must abort the export job.
    ///
    /// `CodecUnsupported` and `WorkerCrash` have recovery paths (fallback
    /// source, direct rendering); everything else ends the job.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::CodecUnsupported { .. } | Self::WorkerCrash { .. }
        )
    }

    /// Whether the frame source should switch to the seek-based fallback.
    pub fn triggers_fallback(&self) -> bool {
        matches!(self, Self::CodecUnsupported { .. } | Self::Container { .. })
    }

    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Container { .. } => "container",
            Self::CodecUnsupported { .. } => "codec_unsupported",
            Self::Decode { .. } => "decode",
            Self::FrameNotAvailable { .. } => "frame_not_available",
            Self::WorkerCrash { .. } => "worker_crash",
            Self::Encode { .. } => "encode",
            Self::Timeout { .. } => "timeout",
            Self::QueueFull { .. } => "queue_full",
            Self::Closed { .. } => "closed",
            Self::Cancelled => "cancelled",
            Self::Config { .. } => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_kinds_are_not_fatal() {
        assert!(!PipelineError::codec_unsupported("avc1", "no decoder").is_fatal());
        assert!(!PipelineError::worker_crash(2, "panic").is_fatal());
        assert!(PipelineError::decode("bad slice").is_fatal());
        assert!(PipelineError::Cancelled.is_fatal());
    }

    #[test]
    fn test_fallback_classification() {
        assert!(PipelineError::codec_unsupported("hvc1", "probe rejected").triggers_fallback());
        assert!(PipelineError::container("not iso-bmff").triggers_fallback());
        assert!(!PipelineError::encode("pipe closed").triggers_fallback());
    }

    #[test]
    fn test_io_error_is_cloneable() {
        let err: PipelineError = std::io::Error::other("disk gone").into();
        let copy = err.clone();
        assert_eq!(copy.kind(), "io");
        assert_eq!(err.to_string(), copy.to_string());
    }
}
