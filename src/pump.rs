//! Frame pump: one background worker per active session.
//!
//! The pump owns its transport handle outright. It opens through the
//! supervisor, pulls, resizes and encodes, and publishes into the session.
//! On a pull failure it releases the handle, marks the session RECONNECTING
//! and re-opens on its next cycle. An open failure ends the worker; the next
//! frame request starts a fresh one. Whatever the exit path, the handle is
//! released by the pump itself, so teardown never races a pull in flight.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::clock::Clock;
use crate::error::PipelineError;
use crate::frame::{FrameProcessor, RawImage};
use crate::ingest::TransportHandle;
use crate::session::{Session, StopToken};
use crate::supervisor::ConnectionSupervisor;

/// Pause after a pull failure before re-opening.
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);
/// Pause after a frame could not be processed.
const PROCESSING_PAUSE: Duration = Duration::from_millis(100);

/// Control handle for a running pump.
pub struct PumpHandle {
    stop: StopToken,
    join: JoinHandle<()>,
}

impl PumpHandle {
    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    pub fn is_alive(&self) -> bool {
        !self.join.is_finished()
    }

    /// Wait for the worker thread. Only called once it has finished.
    pub fn join(self) {
        if self.join.join().is_err() {
            log::error!("FramePump: worker thread panicked");
        }
    }
}

pub struct FramePump {
    session: Arc<Session>,
    supervisor: Arc<ConnectionSupervisor>,
    processor: FrameProcessor,
    clock: Arc<dyn Clock>,
    stop: StopToken,
    frame_interval: Duration,
}

impl FramePump {
    /// Start a pump thread for `session`.
    pub fn spawn(
        session: Arc<Session>,
        supervisor: Arc<ConnectionSupervisor>,
        processor: FrameProcessor,
        clock: Arc<dyn Clock>,
    ) -> Result<PumpHandle> {
        let stop = StopToken::new();
        let frame_interval = supervisor.tunables().frame_interval();
        let url = session.url().to_string();
        let pump = FramePump {
            session,
            supervisor,
            processor,
            clock,
            stop: stop.clone(),
            frame_interval,
        };
        let join = thread::Builder::new()
            .name(thread_name(&url))
            .spawn(move || pump.run())
            .with_context(|| format!("spawn frame pump for {}", url))?;
        Ok(PumpHandle { stop, join })
    }

    fn run(self) {
        let url = self.session.url().to_string();
        log::debug!("FramePump: started for {}", url);
        let mut handle: Option<Box<dyn TransportHandle>> = None;

        while !self.stop.is_cancelled() {
            let cycle_started = Instant::now();

            let Some(active) = handle.as_mut() else {
                match self.supervisor.connect(&self.session, &self.stop) {
                    Ok(opened) => handle = Some(opened),
                    Err(PipelineError::Cancelled) => break,
                    Err(err) => {
                        log::debug!("FramePump: stopping for {}: {}", url, err);
                        break;
                    }
                }
                continue;
            };

            let pulled = catch_unwind(AssertUnwindSafe(|| active.pull()))
                .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(&*panic))));
            match pulled {
                Ok(raw) => match self.publish(raw) {
                    Ok(()) => {}
                    Err(PipelineError::Cancelled) => break,
                    Err(err) => {
                        log::warn!("FramePump: dropped frame from {}: {}", url, err);
                        if !self.stop.sleep(PROCESSING_PAUSE) {
                            break;
                        }
                        continue;
                    }
                },
                Err(err) => {
                    let err = PipelineError::Pull(format!("{:#}", err));
                    log::warn!("FramePump: {} for {}, reconnecting", err, url);
                    if let Some(mut failed) = handle.take() {
                        failed.release();
                    }
                    self.session.mark_reconnecting(&self.stop);
                    if !self.stop.sleep(RECONNECT_PAUSE) {
                        break;
                    }
                    continue;
                }
            }

            let elapsed = cycle_started.elapsed();
            if elapsed < self.frame_interval && !self.stop.sleep(self.frame_interval - elapsed) {
                break;
            }
        }

        if let Some(mut open) = handle.take() {
            open.release();
            self.session.mark_released();
        }
        log::debug!("FramePump: stopped for {}", url);
    }

    fn publish(&self, raw: RawImage) -> Result<(), PipelineError> {
        let processor = self.processor;
        let encoded = catch_unwind(AssertUnwindSafe(move || processor.process(raw)))
            .unwrap_or_else(|panic| Err(PipelineError::Processing(panic_message(&*panic))))?;
        self.session
            .publish(encoded, self.clock.now(), &self.stop)
            .map(|_| ())
            .ok_or(PipelineError::Cancelled)
    }
}

fn thread_name(url: &str) -> String {
    let tail: String = url
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("stream")
        .chars()
        .take(10)
        .collect();
    format!("pump-{}", tail)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::Tunables;
    use crate::ingest::ScriptedTransport;
    use crate::session::SessionStatus;

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn start(transport: &ScriptedTransport, session: &Arc<Session>) -> PumpHandle {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tunables = Tunables {
            fps: 50,
            ..Tunables::default()
        };
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::new(transport.clone()),
            tunables,
            Arc::clone(&clock),
        ));
        FramePump::spawn(
            Arc::clone(session),
            supervisor,
            FrameProcessor::new(640, 80),
            clock,
        )
        .unwrap()
    }

    #[test]
    fn pump_publishes_resized_frames() {
        let transport = ScriptedTransport::new(1280, 720);
        let session = Arc::new(Session::new("fake://wide", Instant::now()));
        let pump = start(&transport, &session);

        assert!(wait_until(Duration::from_secs(5), || session.latest_frame().is_some()));
        let frame = session.latest_frame().unwrap();
        assert_eq!((frame.width, frame.height), (640, 360));
        assert_eq!(session.status(), SessionStatus::Connected);

        pump.stop_token().cancel();
        assert!(wait_until(Duration::from_secs(5), || !pump.is_alive()));
        pump.join();
        assert_eq!(transport.release_count(), 1);
        assert_eq!(transport.live_handles(), 0);
    }

    #[test]
    fn open_failure_ends_worker() {
        let transport = ScriptedTransport::unreachable();
        let session = Arc::new(Session::new("fake://down", Instant::now()));
        let pump = start(&transport, &session);

        assert!(wait_until(Duration::from_secs(5), || !pump.is_alive()));
        pump.join();
        assert_eq!(session.status(), SessionStatus::Error);
        assert_eq!(transport.open_count(), 1);
    }

    #[test]
    fn bad_frames_are_dropped_without_stopping() {
        let transport = ScriptedTransport::new(0, 0);
        let session = Arc::new(Session::new("fake://empty", Instant::now()));
        let pump = start(&transport, &session);

        assert!(wait_until(Duration::from_secs(5), || transport.pull_count() >= 2));
        assert!(pump.is_alive());
        assert!(session.latest_frame().is_none());

        transport.set_frame_size(16, 8);
        assert!(wait_until(Duration::from_secs(5), || session.latest_frame().is_some()));

        pump.stop_token().cancel();
        assert!(wait_until(Duration::from_secs(5), || !pump.is_alive()));
        pump.join();
    }

    #[test]
    fn thread_names_use_last_path_segment() {
        assert_eq!(thread_name("rtsp://10.0.0.4:554/h264/"), "pump-h264");
        assert_eq!(thread_name(""), "pump-stream");
    }
}
