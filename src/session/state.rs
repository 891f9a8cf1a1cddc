//! Per-stream session state.
//!
//! Every mutable field of a session lives behind one `Mutex` so the four roles
//! that touch it (supervisor, pump, reaper, facade) always see a consistent
//! view. The pump is the only writer of frame data. Writes made on behalf of
//! a pump carry its `StopToken` and are dropped once that token is cancelled,
//! so a pump that outlives its teardown cannot overwrite the IDLE state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::frame::{EncodedFrame, FrameBuffer};
use crate::pump::PumpHandle;

const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Connecting,
    Connected,
    Error,
    Reconnecting,
    Cooldown,
    Idle,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "CONNECTED",
            SessionStatus::Error => "ERROR",
            SessionStatus::Reconnecting => "RECONNECTING",
            SessionStatus::Cooldown => "COOLDOWN",
            SessionStatus::Idle => "IDLE",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open-failure bookkeeping. Pull failures never touch it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ErrorHistory {
    pub last_error_at: Option<Instant>,
    pub consecutive_errors: u32,
}

// ----------------------------------------------------------------------------
// StopToken: cooperative cancellation for one pump
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on cancellation.
    /// Returns `false` if cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(STOP_POLL.min(deadline - now));
        }
    }

    pub fn same_as(&self, other: &StopToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    errors: ErrorHistory,
    frames: FrameBuffer,
    last_frame: Option<EncodedFrame>,
    last_frame_at: Option<Instant>,
    last_access_at: Instant,
    frames_published: u64,
    handle_open: bool,
}

/// Point-in-time copy of a session's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub errors: ErrorHistory,
    pub buffered_frames: usize,
    pub has_cached_frame: bool,
    pub last_frame_at: Option<Instant>,
    pub last_access_at: Instant,
    pub frames_published: u64,
    pub handle_open: bool,
    pub pump_alive: bool,
}

/// Outcome of retiring a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpStop {
    /// No pump was registered; the session is now IDLE.
    NotRunning,
    /// The pump exited and the session is now IDLE.
    Stopped,
    /// The pump was cancelled but did not exit within the wait. It stays
    /// registered, cancelled, so no second pump can start until it is gone.
    TimedOut,
    /// Another caller took over the slot while waiting. Session untouched.
    Replaced,
    /// The session was polled after the caller last saw it. Nothing done.
    Touched,
}

pub struct Session {
    url: String,
    state: Mutex<SessionState>,
    pump: Mutex<Option<PumpHandle>>,
}

impl Session {
    pub fn new(url: impl Into<String>, now: Instant) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Idle,
                errors: ErrorHistory::default(),
                frames: FrameBuffer::new(),
                last_frame: None,
                last_frame_at: None,
                last_access_at: now,
                frames_published: 0,
                handle_open: false,
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // A panicking writer leaves whole values behind; keep serving them.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_pump(&self) -> MutexGuard<'_, Option<PumpHandle>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        self.lock().status
    }

    pub fn error_history(&self) -> ErrorHistory {
        self.lock().errors
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let pump_alive = self.pump_alive();
        let state = self.lock();
        SessionSnapshot {
            status: state.status,
            errors: state.errors,
            buffered_frames: state.frames.len(),
            has_cached_frame: state.last_frame.is_some(),
            last_frame_at: state.last_frame_at,
            last_access_at: state.last_access_at,
            frames_published: state.frames_published,
            handle_open: state.handle_open,
            pump_alive,
        }
    }

    pub fn pump_alive(&self) -> bool {
        self.lock_pump().as_ref().is_some_and(PumpHandle::is_alive)
    }

    pub fn touch(&self, now: Instant) {
        self.lock().last_access_at = now;
    }

    pub fn last_access_at(&self) -> Instant {
        self.lock().last_access_at
    }

    /// Newest buffered frame, else the last frame ever published.
    pub fn latest_frame(&self) -> Option<EncodedFrame> {
        let state = self.lock();
        state
            .frames
            .latest()
            .cloned()
            .or_else(|| state.last_frame.clone())
    }

    pub fn buffered_frames(&self) -> Vec<EncodedFrame> {
        self.lock().frames.iter().cloned().collect()
    }

    /// Remaining cooldown at `now`. A session cools down once `max_retries`
    /// consecutive opens have failed, until `retry_interval` has passed since
    /// the last failure. Idle teardown does not cut a cooldown short.
    pub fn cooldown_remaining(
        &self,
        now: Instant,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Option<Duration> {
        let state = self.lock();
        if state.errors.consecutive_errors < max_retries {
            return None;
        }
        let last_error_at = state.errors.last_error_at?;
        let elapsed = now.saturating_duration_since(last_error_at);
        (elapsed < retry_interval).then(|| retry_interval - elapsed)
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Facade side: a pump is about to start.
    pub(crate) fn mark_connecting(&self) {
        self.lock().status = SessionStatus::Connecting;
    }

    /// Supervisor side: an open attempt begins. Returns `false` if cancelled.
    pub(crate) fn begin_open(&self, stop: &StopToken) -> bool {
        let mut state = self.lock();
        if stop.is_cancelled() {
            return false;
        }
        state.status = SessionStatus::Connecting;
        true
    }

    /// Record a failed open and return the resulting status.
    pub(crate) fn record_open_failure(
        &self,
        now: Instant,
        max_retries: u32,
        stop: &StopToken,
    ) -> SessionStatus {
        let mut state = self.lock();
        state.errors.consecutive_errors = state.errors.consecutive_errors.saturating_add(1);
        state.errors.last_error_at = Some(now);
        state.handle_open = false;
        if stop.is_cancelled() {
            return state.status;
        }
        state.status = if state.errors.consecutive_errors >= max_retries {
            SessionStatus::Cooldown
        } else {
            SessionStatus::Error
        };
        state.status
    }

    /// Record a successful open. Returns `false` if the pump was cancelled
    /// meanwhile; the caller then owns releasing the handle.
    pub(crate) fn record_open_success(&self, stop: &StopToken) -> bool {
        let mut state = self.lock();
        if stop.is_cancelled() {
            return false;
        }
        state.errors = ErrorHistory::default();
        state.status = SessionStatus::Connected;
        state.handle_open = true;
        true
    }

    pub(crate) fn mark_reconnecting(&self, stop: &StopToken) {
        let mut state = self.lock();
        state.handle_open = false;
        if !stop.is_cancelled() {
            state.status = SessionStatus::Reconnecting;
        }
    }

    pub(crate) fn mark_released(&self) {
        self.lock().handle_open = false;
    }

    /// Publish a freshly encoded frame. Returns its sequence number, or
    /// `None` if the pump was cancelled.
    pub(crate) fn publish(
        &self,
        frame: EncodedFrame,
        now: Instant,
        stop: &StopToken,
    ) -> Option<u64> {
        let mut state = self.lock();
        if stop.is_cancelled() {
            return None;
        }
        state.frames_published += 1;
        let frame = frame.with_sequence(state.frames_published);
        state.last_frame = Some(frame.clone());
        state.frames.push(frame);
        state.last_frame_at = Some(now);
        Some(state.frames_published)
    }

    /// Idle teardown: buffer cleared, status IDLE, cached frame kept.
    fn mark_idle(&self) {
        let mut state = self.lock();
        state.frames.clear();
        state.handle_open = false;
        state.status = SessionStatus::Idle;
    }

    // ------------------------------------------------------------------------
    // Pump control
    // ------------------------------------------------------------------------

    /// Facade side: a start was refused because the stream is cooling down.
    pub(crate) fn mark_cooldown(&self) {
        self.lock().status = SessionStatus::Cooldown;
    }

    /// Cancel the running pump, wait up to `wait` for it to exit and mark the
    /// session IDLE. The IDLE write happens under the pump slot lock, and only
    /// while the slot is empty or still holds the pump cancelled here.
    ///
    /// With `seen_access`, nothing is done if the session was polled after
    /// that instant. Polls record access under the slot lock, so the check
    /// and the cancellation are atomic with respect to them.
    pub(crate) fn retire(&self, wait: Duration, seen_access: Option<Instant>) -> PumpStop {
        let token = {
            let slot = self.lock_pump();
            if seen_access.is_some_and(|seen| self.last_access_at() > seen) {
                return PumpStop::Touched;
            }
            let Some(pump) = slot.as_ref() else {
                self.mark_idle();
                return PumpStop::NotRunning;
            };
            pump.stop_token().cancel();
            pump.stop_token().clone()
        };

        let deadline = Instant::now() + wait;
        loop {
            {
                let mut slot = self.lock_pump();
                let finished = match slot.as_ref() {
                    Some(pump) if pump.stop_token().same_as(&token) => !pump.is_alive(),
                    _ => return PumpStop::Replaced,
                };
                if finished {
                    if let Some(pump) = slot.take() {
                        pump.join();
                    }
                    self.mark_idle();
                    return PumpStop::Stopped;
                }
                if Instant::now() >= deadline {
                    // Its writes are gated on the cancelled token.
                    self.mark_idle();
                    return PumpStop::TimedOut;
                }
            }
            std::thread::sleep(STOP_POLL);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.url)
            .field("status", &self.status())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> EncodedFrame {
        EncodedFrame::new(vec![tag], 1, 1)
    }

    #[test]
    fn open_failures_escalate_to_cooldown() {
        let session = Session::new("fake://cam", Instant::now());
        let stop = StopToken::new();
        let now = Instant::now();

        assert_eq!(session.record_open_failure(now, 3, &stop), SessionStatus::Error);
        assert_eq!(session.record_open_failure(now, 3, &stop), SessionStatus::Error);
        assert_eq!(session.record_open_failure(now, 3, &stop), SessionStatus::Cooldown);
        assert_eq!(session.error_history().consecutive_errors, 3);

        let retry = Duration::from_secs(5);
        assert_eq!(session.cooldown_remaining(now, 3, retry), Some(retry));
        assert_eq!(
            session.cooldown_remaining(now + Duration::from_secs(2), 3, retry),
            Some(Duration::from_secs(3))
        );
        assert_eq!(session.cooldown_remaining(now + retry, 3, retry), None);

        session.mark_idle();
        assert_eq!(session.cooldown_remaining(now, 3, retry), Some(retry));
    }

    #[test]
    fn open_success_resets_history() {
        let session = Session::new("fake://cam", Instant::now());
        let stop = StopToken::new();
        session.record_open_failure(Instant::now(), 3, &stop);
        assert!(session.record_open_success(&stop));
        assert_eq!(session.error_history(), ErrorHistory::default());
        assert_eq!(session.status(), SessionStatus::Connected);
        assert!(session.snapshot().handle_open);
    }

    #[test]
    fn cached_frame_survives_idle_teardown() {
        let session = Session::new("fake://cam", Instant::now());
        let stop = StopToken::new();
        session.publish(frame(1), Instant::now(), &stop);
        session.publish(frame(2), Instant::now(), &stop);

        session.mark_idle();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.buffered_frames, 0);
        let cached = session.latest_frame().unwrap();
        assert_eq!(cached.bytes(), &[2]);
        assert_eq!(cached.sequence(), 2);
    }

    #[test]
    fn cancelled_pump_cannot_write() {
        let session = Session::new("fake://cam", Instant::now());
        let stop = StopToken::new();
        stop.cancel();

        assert!(session.publish(frame(1), Instant::now(), &stop).is_none());
        assert!(!session.record_open_success(&stop));
        session.mark_reconnecting(&stop);
        assert_eq!(session.status(), SessionStatus::Idle);
        assert!(session.latest_frame().is_none());
    }

    #[test]
    fn buffer_holds_three_newest_frames() {
        let session = Session::new("fake://cam", Instant::now());
        let stop = StopToken::new();
        for tag in 1..=5u8 {
            session.publish(frame(tag), Instant::now(), &stop);
        }
        let tags: Vec<u8> = session
            .buffered_frames()
            .iter()
            .map(|f| f.bytes()[0])
            .collect();
        assert_eq!(tags, vec![3, 4, 5]);
    }

    #[test]
    fn stop_token_sleep_wakes_on_cancel() {
        let stop = StopToken::new();
        let remote = stop.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let started = Instant::now();
        assert!(!stop.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn retire_without_pump_marks_idle() {
        let session = Session::new("fake://cam", Instant::now());
        session.mark_connecting();
        assert_eq!(session.retire(Duration::from_millis(10), None), PumpStop::NotRunning);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn retire_skips_sessions_polled_since_last_seen() {
        let seen = Instant::now();
        let session = Session::new("fake://cam", seen);
        let stop = StopToken::new();
        assert!(session.record_open_success(&stop));
        session.publish(frame(1), seen, &stop);
        session.touch(seen + Duration::from_secs(1));

        assert_eq!(session.retire(Duration::from_millis(10), Some(seen)), PumpStop::Touched);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, SessionStatus::Connected);
        assert_eq!(snapshot.buffered_frames, 1);
        assert!(snapshot.handle_open);
    }
}
