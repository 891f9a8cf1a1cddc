//! Programmable in-process transport.
//!
//! `ScriptedTransport` stands in for a camera in tests and demos: opens and
//! pulls succeed or fail on command, every open/pull/release is counted, and
//! an optional `OpenGate` holds each open until the test lets it through.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{CaptureHints, FrameTransport, TransportHandle, TransportOptions};
use crate::frame::RawImage;

#[derive(Default)]
struct Shared {
    fail_opens: AtomicBool,
    fail_pulls: AtomicBool,
    reject_hints: AtomicBool,
    frame_size: Mutex<(u32, u32)>,
    pull_delay: Mutex<Duration>,
    opens: AtomicU32,
    releases: AtomicU32,
    pulls: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
    last_options: Mutex<Option<TransportOptions>>,
}

/// Fake transport whose behaviour is switched at runtime.
#[derive(Clone)]
pub struct ScriptedTransport {
    shared: Arc<Shared>,
    gate: Option<Arc<Mutex<Receiver<()>>>>,
}

/// Releases gated opens one at a time.
#[derive(Clone)]
pub struct OpenGate {
    tx: Sender<()>,
}

impl OpenGate {
    /// Let one pending (or future) open proceed.
    pub fn release(&self) {
        let _ = self.tx.send(());
    }
}

impl ScriptedTransport {
    /// Opens succeed and every pull yields a `width` x `height` frame.
    pub fn new(width: u32, height: u32) -> Self {
        let shared = Shared {
            frame_size: Mutex::new((width, height)),
            ..Shared::default()
        };
        Self {
            shared: Arc::new(shared),
            gate: None,
        }
    }

    /// Every open fails.
    pub fn unreachable() -> Self {
        let transport = Self::new(64, 48);
        transport.fail_opens(true);
        transport
    }

    /// Make every open wait for `OpenGate::release`.
    pub fn gated(mut self) -> (Self, OpenGate) {
        let (tx, rx) = mpsc::channel();
        self.gate = Some(Arc::new(Mutex::new(rx)));
        (self, OpenGate { tx })
    }

    pub fn fail_opens(&self, fail: bool) {
        self.shared.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pulls(&self, fail: bool) {
        self.shared.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn reject_hints(&self, reject: bool) {
        self.shared.reject_hints.store(reject, Ordering::SeqCst);
    }

    pub fn set_frame_size(&self, width: u32, height: u32) {
        *self
            .shared
            .frame_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = (width, height);
    }

    /// Simulated per-pull network latency.
    pub fn set_pull_delay(&self, delay: Duration) {
        *self
            .shared
            .pull_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn open_count(&self) -> u32 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u32 {
        self.shared.releases.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> u64 {
        self.shared.pulls.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet released.
    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live handles ever observed.
    pub fn max_live_handles(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    /// Options passed to the most recent open.
    pub fn last_options(&self) -> Option<TransportOptions> {
        self.shared
            .last_options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl FrameTransport for ScriptedTransport {
    fn open(&self, url: &str, options: &TransportOptions) -> Result<Box<dyn TransportHandle>> {
        if let Some(gate) = &self.gate {
            let rx = gate.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
                .map_err(|_| anyhow!("open gate for {} dropped", url))?;
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        *self
            .shared
            .last_options
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(options.clone());
        if self.shared.fail_opens.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused by {}", url));
        }
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandle {
            shared: Arc::clone(&self.shared),
            frame_count: 0,
            released: false,
        }))
    }
}

struct ScriptedHandle {
    shared: Arc<Shared>,
    frame_count: u64,
    released: bool,
}

impl TransportHandle for ScriptedHandle {
    fn configure(&mut self, _hints: &CaptureHints) -> Result<()> {
        if self.shared.reject_hints.load(Ordering::SeqCst) {
            return Err(anyhow!("hints rejected"));
        }
        Ok(())
    }

    fn pull(&mut self) -> Result<RawImage> {
        if self.released {
            return Err(anyhow!("pull on released handle"));
        }
        let delay = *self
            .shared
            .pull_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.shared.fail_pulls.load(Ordering::SeqCst) {
            return Err(anyhow!("end of stream"));
        }
        self.shared.pulls.fetch_add(1, Ordering::SeqCst);
        self.frame_count += 1;
        let (width, height) = *self
            .shared
            .frame_size
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let shade = (self.frame_count % 256) as u8;
        Ok(RawImage::filled(width, height, [shade, 128, 255 - shade]))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}
