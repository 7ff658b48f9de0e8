//! Deadline-bounded page-readiness loops.
//!
//! Readiness is inherently racy (a page may never fire the expected event),
//! so every strategy degrades to "wait until the deadline" and reports
//! whether the condition was actually met instead of raising. Every frame
//! received while waiting is still routed through the tracker.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::error::SessionError;
use crate::session::CdpSession;
use crate::transport::CdpTransport;

/// Per-iteration receive window for the event-driven strategies.
const EVENT_POLL: Duration = Duration::from_millis(500);
/// Shorter window for network-idle, which re-checks the in-flight set often.
const IDLE_POLL: Duration = Duration::from_millis(200);

impl<T: CdpTransport> CdpSession<T> {
    /// Block until `Page.loadEventFired` or the deadline.
    pub async fn wait_for_load(&mut self, max_wait: Duration) -> Result<bool, SessionError> {
        self.wait_for_page_event("Page.loadEventFired", max_wait)
            .await
    }

    /// Block until `Page.domContentEventFired` or the deadline.
    pub async fn wait_for_dom_content(&mut self, max_wait: Duration) -> Result<bool, SessionError> {
        self.wait_for_page_event("Page.domContentEventFired", max_wait)
            .await
    }

    async fn wait_for_page_event(
        &mut self,
        event: &str,
        max_wait: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(target: "cdp-wait", event, "deadline reached before readiness event");
                return Ok(false);
            }

            match self.recv_slice(remaining.min(EVENT_POLL)).await {
                Ok(Some(raw)) => {
                    if let Some(message) = self.ingest(&raw) {
                        if message.get("method").and_then(Value::as_str) == Some(event) {
                            return Ok(true);
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    // A dying socket ends the wait; the next command surfaces it.
                    debug!(target: "cdp-wait", %err, "receive failed during wait");
                    return Ok(false);
                }
            }
        }
    }

    /// Block until the in-flight set has been continuously empty for
    /// `quiet`, or the deadline. Any new in-flight request resets the idle
    /// timer.
    pub async fn wait_for_network_idle(
        &mut self,
        quiet: Duration,
        max_wait: Duration,
    ) -> Result<bool, SessionError> {
        let deadline = Instant::now() + max_wait;
        let mut idle_since: Option<Instant> = None;

        loop {
            if self.tracker().is_idle() {
                let started = *idle_since.get_or_insert_with(Instant::now);
                if started.elapsed() >= quiet {
                    return Ok(true);
                }
            } else {
                idle_since = None;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(target: "cdp-wait", "deadline reached before network idle");
                return Ok(false);
            }

            match self.recv_slice(remaining.min(IDLE_POLL)).await {
                Ok(Some(raw)) => {
                    self.ingest(&raw);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(target: "cdp-wait", %err, "receive failed during idle wait");
                    return Ok(false);
                }
            }
        }
    }
}
