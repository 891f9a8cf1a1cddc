//! Error types.
//!
//! | Type | Crosses the core boundary | Variants |
//! |------|---------------------------|----------|
//! | [`FrameError`] | yes, returned to the request layer | `NotFound`, `Unavailable` |
//! | [`PipelineError`] | no, absorbed into session state and logs | `Open`, `Cooldown`, `Pull`, `Processing`, `Cancelled` |
//!
//! Transport backends and the HTTP shim use `anyhow::Result` internally; the
//! supervisor and pump convert those into `PipelineError` at the seam.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the frame access facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The index does not refer to a configured stream (404).
    #[error("stream {index} not found")]
    NotFound {
        /// Requested position in the configured stream list.
        index: usize,
    },

    /// No frame has been produced yet, or the stream is currently down (503).
    #[error("stream '{name}' unavailable")]
    Unavailable {
        /// Configured display name of the stream.
        name: String,
    },
}

impl FrameError {
    /// HTTP status equivalent.
    pub fn status_code(&self) -> u16 {
        match self {
            FrameError::NotFound { .. } => 404,
            FrameError::Unavailable { .. } => 503,
        }
    }
}

/// Failures inside a stream pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The transport could not be established.
    #[error("open failed for {url}: {message}")]
    Open { url: String, message: String },

    /// Too many consecutive open failures; no attempt was made.
    #[error("cooling down after {failures} failed opens ({remaining:?} left)")]
    Cooldown { failures: u32, remaining: Duration },

    /// Mid-stream read failure.
    #[error("pull failed: {0}")]
    Pull(String),

    /// Resize or encode failure; the frame is dropped.
    #[error("frame processing failed: {0}")]
    Processing(String),

    /// The session was stopped while the operation was in flight.
    #[error("session stopped")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_errors_map_to_http_statuses() {
        assert_eq!(FrameError::NotFound { index: 7 }.status_code(), 404);
        let unavailable = FrameError::Unavailable {
            name: "porch".to_string(),
        };
        assert_eq!(unavailable.status_code(), 503);
        assert_eq!(unavailable.to_string(), "stream 'porch' unavailable");
    }
}
