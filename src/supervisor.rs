//! Connection supervisor.
//!
//! Turns a stream URL into an open transport handle or a definitive failure:
//! - refuses to open while the session is cooling down
//! - classifies the URL and attaches low-latency connection options
//! - records open success or failure on the session
//! - applies capture hints best-effort once the handle is open

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Tunables;
use crate::error::PipelineError;
use crate::ingest::{classify, connection_options, CaptureHints, FrameTransport, TransportHandle};
use crate::session::{Session, SessionStatus, StopToken};

pub struct ConnectionSupervisor {
    transport: Arc<dyn FrameTransport>,
    tunables: Tunables,
    clock: Arc<dyn Clock>,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        tunables: Tunables,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            tunables,
            clock,
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Open the transport for `session`. Blocking; runs on the pump thread.
    pub fn connect(
        &self,
        session: &Session,
        stop: &StopToken,
    ) -> Result<Box<dyn TransportHandle>, PipelineError> {
        let url = session.url();
        if let Some(remaining) = session.cooldown_remaining(
            self.clock.now(),
            self.tunables.max_retries,
            self.tunables.retry_interval,
        ) {
            return Err(PipelineError::Cooldown {
                failures: session.error_history().consecutive_errors,
                remaining,
            });
        }
        if !session.begin_open(stop) {
            return Err(PipelineError::Cancelled);
        }

        let kind = classify(url);
        let options = connection_options(kind, &self.tunables);
        log::debug!("Supervisor: opening {} as {}", url, kind.as_str());

        let mut handle = match self.transport.open(url, &options) {
            Ok(handle) => handle,
            Err(err) => {
                let status =
                    session.record_open_failure(self.clock.now(), self.tunables.max_retries, stop);
                let errors = session.error_history();
                if status == SessionStatus::Cooldown {
                    log::warn!(
                        "Supervisor: {} failed {} times in a row, cooling down for {:?}",
                        url,
                        errors.consecutive_errors,
                        self.tunables.retry_interval
                    );
                } else {
                    log::warn!(
                        "Supervisor: open failed for {} (attempt {}): {:#}",
                        url,
                        errors.consecutive_errors,
                        err
                    );
                }
                return Err(PipelineError::Open {
                    url: url.to_string(),
                    message: format!("{:#}", err),
                });
            }
        };

        if !session.record_open_success(stop) {
            handle.release();
            return Err(PipelineError::Cancelled);
        }
        log::info!("Supervisor: connected to {}", url);

        let hints = CaptureHints::for_kind(kind, &self.tunables);
        if let Err(err) = handle.configure(&hints) {
            log::debug!("Supervisor: capture hints ignored for {}: {:#}", url, err);
        }
        Ok(handle)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
