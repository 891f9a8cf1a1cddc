//! Stillframe: polled JPEG stills from long-running camera streams.
//!
//! Every configured stream gets a session the first time someone asks for a
//! frame. The session runs one background pump that keeps the latest frame
//! fresh, survives flaky sources with bounded retry and cooldown, and is torn
//! down again once nobody has polled it for a while.
//!
//! # Module Structure
//!
//! - `hub`: `StreamHub`, the frame access facade and the crate's context object
//! - `session`: session registry, per-stream state machine, stop tokens
//! - `supervisor`: opens transports, applies the retry/cooldown policy
//! - `pump`: per-session worker that pulls, resizes, encodes and publishes
//! - `reaper`: periodic idle teardown
//! - `ingest`: transport boundary and backends (stub, HTTP MJPEG, GStreamer)
//! - `frame`: raw and encoded frames, the frame ring, the JPEG processor
//! - `config`, `clock`, `error`: ambient plumbing
//! - `api`: small HTTP shim serving the facade

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod pump;
pub mod reaper;
pub mod session;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ApiSettings, StillframeConfig, StreamDescriptor, Tunables};
pub use error::{FrameError, PipelineError};
pub use frame::{EncodedFrame, FrameBuffer, FrameProcessor, RawImage, FRAME_BUFFER_CAPACITY};
pub use hub::{StreamHub, StreamSummary};
pub use ingest::{DefaultTransport, FrameTransport, ScriptedTransport, TransportHandle};
pub use reaper::{IdleReaper, ReaperHandle};
pub use session::{SessionSnapshot, SessionStatus};
