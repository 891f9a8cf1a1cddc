//! Frame access facade.
//!
//! `StreamHub` is the context object the request layer talks to. It owns the
//! configured stream list, the session registry and the shared supervisor,
//! and it is the only place pumps are started. Requests never block on the
//! network: a frame request records access, makes sure a pump is running,
//! and returns whatever is cached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::{StreamDescriptor, Tunables};
use crate::error::FrameError;
use crate::frame::{EncodedFrame, FrameProcessor};
use crate::ingest::FrameTransport;
use crate::pump::FramePump;
use crate::reaper::{teardown, IdleReaper, ReaperHandle};
use crate::session::{Session, SessionRegistry, SessionSnapshot, SessionStatus};
use crate::supervisor::ConnectionSupervisor;

/// Bounded wait for a cancelled pump to exit.
pub const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Public view of one configured stream. The URL is left out on purpose:
/// it often carries camera credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub index: usize,
    pub name: String,
    pub status: SessionStatus,
}

pub struct StreamHub {
    streams: Vec<StreamDescriptor>,
    tunables: Tunables,
    registry: Arc<SessionRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    processor: FrameProcessor,
    clock: Arc<dyn Clock>,
}

impl StreamHub {
    pub fn new(
        streams: Vec<StreamDescriptor>,
        tunables: Tunables,
        transport: Arc<dyn FrameTransport>,
    ) -> Self {
        Self::with_clock(streams, tunables, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        streams: Vec<StreamDescriptor>,
        tunables: Tunables,
        transport: Arc<dyn FrameTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            transport,
            tunables.clone(),
            Arc::clone(&clock),
        ));
        Self {
            streams,
            processor: FrameProcessor::new(tunables.max_width, tunables.quality),
            tunables,
            registry: Arc::new(SessionRegistry::new()),
            supervisor,
            clock,
        }
    }

    pub fn streams(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Latest frame for `url`, starting its session if needed.
    ///
    /// Returns the newest buffered frame, else the last frame the stream
    /// ever produced, else `None`.
    pub fn get_frame(&self, url: &str) -> Option<EncodedFrame> {
        let now = self.clock.now();
        let session = self.registry.get_or_create(url, now);
        self.ensure_pump(&session, now);
        session.latest_frame()
    }

    /// Latest frame for the stream at `index` in the configured list.
    pub fn frame(&self, index: usize) -> Result<EncodedFrame, FrameError> {
        let stream = self.stream(index)?;
        self.get_frame(&stream.url)
            .ok_or_else(|| FrameError::Unavailable {
                name: stream.name.clone(),
            })
    }

    pub fn list_streams(&self) -> Vec<StreamSummary> {
        self.streams
            .iter()
            .enumerate()
            .map(|(index, stream)| StreamSummary {
                index,
                name: stream.name.clone(),
                status: self.status_of(&stream.url),
            })
            .collect()
    }

    /// Status of the stream at `index`. Streams never requested report IDLE.
    pub fn stream_status(&self, index: usize) -> Result<SessionStatus, FrameError> {
        let stream = self.stream(index)?;
        Ok(self.status_of(&stream.url))
    }

    pub fn session_snapshot(&self, url: &str) -> Option<SessionSnapshot> {
        self.registry.get(url).map(|session| session.snapshot())
    }

    pub fn idle_reaper(&self) -> IdleReaper {
        IdleReaper::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            self.tunables.idle_timeout,
            PUMP_JOIN_TIMEOUT,
        )
    }

    pub fn spawn_reaper(&self) -> Result<ReaperHandle> {
        self.idle_reaper().spawn(self.tunables.reap_interval)
    }

    /// Stop every pump and drop all session state, cached frames included.
    pub fn shutdown(&self) {
        let sessions = self.registry.drain();
        log::info!("StreamHub: shutting down {} sessions", sessions.len());
        for session in sessions {
            teardown(&session, PUMP_JOIN_TIMEOUT, None);
        }
    }

    fn stream(&self, index: usize) -> Result<&StreamDescriptor, FrameError> {
        self.streams.get(index).ok_or(FrameError::NotFound { index })
    }

    fn status_of(&self, url: &str) -> SessionStatus {
        self.registry
            .get(url)
            .map(|session| session.status())
            .unwrap_or(SessionStatus::Idle)
    }

    /// Record access at `now` and start a pump unless one is alive or the
    /// stream is cooling down.
    fn ensure_pump(&self, session: &Arc<Session>, now: Instant) {
        // The slot stays locked until the new pump is registered, so
        // concurrent callers cannot both start one. Access is recorded under
        // the same lock the reaper checks it under.
        let mut slot = session.lock_pump();
        session.touch(now);
        if slot.as_ref().is_some_and(|pump| pump.is_alive()) {
            return;
        }
        if let Some(finished) = slot.take() {
            finished.join();
        }
        if let Some(remaining) = session.cooldown_remaining(
            now,
            self.tunables.max_retries,
            self.tunables.retry_interval,
        ) {
            log::debug!(
                "StreamHub: {} cooling down, {:?} until next attempt",
                session.url(),
                remaining
            );
            session.mark_cooldown();
            return;
        }

        session.mark_connecting();
        match FramePump::spawn(
            Arc::clone(session),
            Arc::clone(&self.supervisor),
            self.processor,
            Arc::clone(&self.clock),
        ) {
            Ok(pump) => *slot = Some(pump),
            Err(err) => log::error!(
                "StreamHub: could not start pump for {}: {:#}",
                session.url(),
                err
            ),
        }
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        if !self.registry.is_empty() {
            self.shutdown();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
