//! Idle reaper: periodically tears down sessions nobody has polled lately.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::clock::Clock;
use crate::session::{PumpStop, Session, SessionRegistry, SessionStatus, StopToken};

#[derive(Clone)]
pub struct IdleReaper {
    registry: Arc<SessionRegistry>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    join_timeout: Duration,
}

#[derive(Debug)]
pub struct ReaperHandle {
    stop: StopToken,
    join: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    pub fn stop(mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("idle reaper thread panicked"))?;
        }
        Ok(())
    }
}

impl IdleReaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
        idle_timeout: Duration,
        join_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            idle_timeout,
            join_timeout,
        }
    }

    /// One pass over the registry. Returns the number of sessions torn down.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut reaped = 0;
        for session in self.registry.sessions() {
            if session.status() == SessionStatus::Idle && !session.pump_alive() {
                continue;
            }
            let last_access = session.last_access_at();
            let idle_for = now.saturating_duration_since(last_access);
            if idle_for <= self.idle_timeout {
                continue;
            }
            if teardown(&session, self.join_timeout, Some(last_access)) {
                log::info!(
                    "IdleReaper: {} idle for {:?}, session stopped",
                    session.url(),
                    idle_for
                );
                reaped += 1;
            }
        }
        reaped
    }

    /// Run `sweep` every `interval` on a background thread.
    pub fn spawn(self, interval: Duration) -> Result<ReaperHandle> {
        let stop = StopToken::new();
        let stop_thread = stop.clone();
        let join = thread::Builder::new()
            .name("idle-reaper".to_string())
            .spawn(move || {
                while stop_thread.sleep(interval) {
                    self.sweep();
                }
            })
            .context("spawn idle reaper")?;
        Ok(ReaperHandle {
            stop,
            join: Some(join),
        })
    }
}

/// Stop the session's pump and mark it IDLE. The cached frame is kept.
///
/// `seen_access` is the access time the caller based its decision on; a poll
/// after it cancels the teardown. Returns whether the session was retired.
pub(crate) fn teardown(
    session: &Session,
    join_timeout: Duration,
    seen_access: Option<Instant>,
) -> bool {
    match session.retire(join_timeout, seen_access) {
        PumpStop::NotRunning | PumpStop::Stopped => true,
        PumpStop::TimedOut => {
            log::warn!(
                "teardown: pump for {} did not stop within {:?}; it will release its handle on exit",
                session.url(),
                join_timeout
            );
            true
        }
        PumpStop::Replaced => {
            log::debug!("teardown: {} restarted meanwhile", session.url());
            false
        }
        PumpStop::Touched => {
            log::debug!("teardown: {} polled again, kept", session.url());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn sweep_skips_recently_used_sessions() {
        let registry = Arc::new(SessionRegistry::new());
        let clock = Arc::new(ManualClock::new());
        let reaper = IdleReaper::new(
            Arc::clone(&registry),
            clock.clone(),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        let session = registry.get_or_create("fake://a", clock.now());
        session.mark_connecting();
        assert_eq!(reaper.sweep(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(reaper.sweep(), 1);
        assert_eq!(session.status(), SessionStatus::Idle);

        // Already idle with no pump: nothing to do.
        assert_eq!(reaper.sweep(), 0);
    }

    #[test]
    fn teardown_keeps_session_polled_after_decision() {
        let clock = ManualClock::new();
        let seen = clock.now();
        let session = Session::new("fake://b", seen);
        session.mark_connecting();

        clock.advance(Duration::from_secs(3));
        session.touch(clock.now());
        assert!(!teardown(&session, Duration::from_millis(100), Some(seen)));
        assert_eq!(session.status(), SessionStatus::Connecting);

        assert!(teardown(&session, Duration::from_millis(100), None));
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn spawned_reaper_stops_cleanly() {
        let reaper = IdleReaper::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(ManualClock::new()),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );
        let handle = reaper.spawn(Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(30));
        handle.stop().unwrap();
    }
}
