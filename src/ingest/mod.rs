//! Transport boundary.
//!
//! Sessions talk to remote sources through two traits:
//! - `FrameTransport::open(url, options)` establishes a connection
//! - `TransportHandle` pulls decoded frames, accepts best-effort tuning hints,
//!   and is released exactly once by its owner
//!
//! Backends:
//! - `stub://` synthetic pattern source (always available)
//! - HTTP MJPEG / JPEG snapshot sources (feature: ingest-http)
//! - RTSP and other streaming transports via GStreamer (feature: rtsp-gstreamer)
//! - `ScriptedTransport` for tests and demos
//!
//! URL classification is the only source-specific branching in the crate.
//! A new source kind is added here, never in the session state machine.

#[cfg(feature = "ingest-http")]
pub mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
pub mod rtsp;
pub mod scripted;
pub mod stub;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

use crate::config::Tunables;
use crate::frame::RawImage;

pub use scripted::{OpenGate, ScriptedTransport};
pub use stub::SyntheticSource;

/// Connection parameters handed to `FrameTransport::open`.
pub type TransportOptions = BTreeMap<String, String>;

pub const OPT_RTSP_TRANSPORT: &str = "rtsp_transport";
pub const OPT_FFLAGS: &str = "fflags";
pub const OPT_FLAGS: &str = "flags";
pub const OPT_MAX_DELAY: &str = "max_delay";
pub const OPT_REORDER_QUEUE_SIZE: &str = "reorder_queue_size";
/// Socket timeout in microseconds.
pub const OPT_TIMEOUT_US: &str = "stimeout";
/// Read/write timeout in microseconds.
pub const OPT_RW_TIMEOUT_US: &str = "rw_timeout";
pub const OPT_RECONNECT: &str = "reconnect";

const MAX_DELAY_US: u64 = 500_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// RTSP, RTMP, UDP, HLS and anything else a streaming demuxer handles.
    TransportStream,
    /// HTTP MJPEG (multipart) or single-JPEG snapshot endpoints.
    HttpImageSequence,
    /// `stub://` synthetic frames.
    Synthetic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::TransportStream => "transport-stream",
            SourceKind::HttpImageSequence => "http-image-sequence",
            SourceKind::Synthetic => "synthetic",
        }
    }
}

/// Classify a source URL by scheme and path suffix.
pub fn classify(url: &str) -> SourceKind {
    let Ok(parsed) = Url::parse(url.trim()) else {
        // Unparseable URLs go to the streaming backend, which reports the open failure.
        return SourceKind::TransportStream;
    };
    match parsed.scheme() {
        "stub" => SourceKind::Synthetic,
        "http" | "https" => {
            let path = parsed.path().to_ascii_lowercase();
            let streaming_suffix = [".m3u8", ".ts", ".flv", ".mp4", ".mkv"]
                .iter()
                .any(|suffix| path.ends_with(suffix));
            if streaming_suffix {
                SourceKind::TransportStream
            } else {
                SourceKind::HttpImageSequence
            }
        }
        _ => SourceKind::TransportStream,
    }
}

/// Low-latency connection options for a source kind.
pub fn connection_options(kind: SourceKind, tunables: &Tunables) -> TransportOptions {
    let timeout_us = tunables.reconnect_timeout.as_micros().to_string();
    let mut options = TransportOptions::new();
    match kind {
        SourceKind::TransportStream => {
            options.insert(OPT_RTSP_TRANSPORT.into(), "tcp".into());
            options.insert(OPT_FFLAGS.into(), "nobuffer".into());
            options.insert(OPT_FLAGS.into(), "low_delay".into());
            options.insert(OPT_MAX_DELAY.into(), MAX_DELAY_US.to_string());
            options.insert(OPT_REORDER_QUEUE_SIZE.into(), "0".into());
            options.insert(OPT_TIMEOUT_US.into(), timeout_us.clone());
            options.insert(OPT_RW_TIMEOUT_US.into(), timeout_us);
        }
        SourceKind::HttpImageSequence => {
            options.insert(OPT_FFLAGS.into(), "nobuffer".into());
            options.insert(OPT_RECONNECT.into(), "1".into());
            options.insert(OPT_TIMEOUT_US.into(), timeout_us.clone());
            options.insert(OPT_RW_TIMEOUT_US.into(), timeout_us);
        }
        SourceKind::Synthetic => {}
    }
    options
}

/// Read a microsecond timeout option as a `Duration`.
pub fn timeout_option(options: &TransportOptions, key: &str) -> Option<Duration> {
    options
        .get(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|us| *us > 0)
        .map(Duration::from_micros)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Auto,
}

/// Tuning applied to an open handle. Backends may ignore any of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureHints {
    /// Frames the backend may queue internally.
    pub buffer_size: u32,
    pub transport_mode: TransportMode,
    pub fps: u32,
}

impl CaptureHints {
    pub fn for_kind(kind: SourceKind, tunables: &Tunables) -> Self {
        Self {
            buffer_size: 1,
            transport_mode: match kind {
                SourceKind::TransportStream => TransportMode::Tcp,
                _ => TransportMode::Auto,
            },
            fps: tunables.fps,
        }
    }
}

pub trait FrameTransport: Send + Sync {
    /// Establish a connection. Blocking; never called on a request thread.
    fn open(&self, url: &str, options: &TransportOptions) -> Result<Box<dyn TransportHandle>>;
}

pub trait TransportHandle: Send {
    /// Apply tuning hints. Unsupported hints are an error the caller logs and ignores.
    fn configure(&mut self, hints: &CaptureHints) -> Result<()> {
        let _ = hints;
        Err(anyhow!("capture hints not supported by this transport"))
    }

    /// Block until the next decoded frame is available.
    fn pull(&mut self) -> Result<RawImage>;

    /// Close the connection. Called once by the owning pump.
    fn release(&mut self);
}

/// Routes each URL to the backend for its `SourceKind`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultTransport;

impl FrameTransport for DefaultTransport {
    fn open(&self, url: &str, options: &TransportOptions) -> Result<Box<dyn TransportHandle>> {
        match classify(url) {
            SourceKind::Synthetic => Ok(Box::new(SyntheticSource::open(url)?)),
            SourceKind::HttpImageSequence => {
                #[cfg(feature = "ingest-http")]
                {
                    Ok(Box::new(mjpeg::MjpegSource::open(url, options)?))
                }
                #[cfg(not(feature = "ingest-http"))]
                {
                    let _ = options;
                    anyhow::bail!("http sources require the ingest-http feature")
                }
            }
            SourceKind::TransportStream => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    Ok(Box::new(rtsp::GstreamerSource::open(url, options)?))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    let _ = options;
                    anyhow::bail!("streaming sources require the rtsp-gstreamer feature")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_scheme_and_suffix() {
        assert_eq!(
            classify("rtsp://10.0.0.4:554/h264"),
            SourceKind::TransportStream
        );
        assert_eq!(classify("rtmp://cam/live"), SourceKind::TransportStream);
        assert_eq!(
            classify("http://10.0.0.9:81/stream"),
            SourceKind::HttpImageSequence
        );
        assert_eq!(
            classify("https://cam.local/snapshot.jpg"),
            SourceKind::HttpImageSequence
        );
        assert_eq!(
            classify("https://cdn.local/live/index.m3u8"),
            SourceKind::TransportStream
        );
        assert_eq!(classify("stub://porch"), SourceKind::Synthetic);
        assert_eq!(classify("not a url"), SourceKind::TransportStream);
    }

    #[test]
    fn streaming_options_request_low_latency_tcp() {
        let tunables = Tunables {
            reconnect_timeout: Duration::from_secs(3),
            ..Tunables::default()
        };
        let options = connection_options(SourceKind::TransportStream, &tunables);
        assert_eq!(options.get(OPT_RTSP_TRANSPORT).map(String::as_str), Some("tcp"));
        assert_eq!(options.get(OPT_FFLAGS).map(String::as_str), Some("nobuffer"));
        assert_eq!(options.get(OPT_FLAGS).map(String::as_str), Some("low_delay"));
        assert_eq!(
            timeout_option(&options, OPT_TIMEOUT_US),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn http_options_carry_timeouts_but_no_rtsp_transport() {
        let options = connection_options(SourceKind::HttpImageSequence, &Tunables::default());
        assert!(!options.contains_key(OPT_RTSP_TRANSPORT));
        assert_eq!(
            timeout_option(&options, OPT_RW_TIMEOUT_US),
            Some(Tunables::default().reconnect_timeout)
        );
        assert!(connection_options(SourceKind::Synthetic, &Tunables::default()).is_empty());
    }

    #[test]
    fn default_transport_opens_stub_sources() {
        let mut handle = DefaultTransport
            .open("stub://test?width=64&height=48", &TransportOptions::new())
            .unwrap();
        let frame = handle.pull().unwrap();
        assert_eq!((frame.width, frame.height), (64, 48));
        handle.release();
    }
}
