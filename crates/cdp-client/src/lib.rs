//! DevTools-protocol snapshot client.
//!
//! One snapshot call drives a fresh protocol session over a duplex websocket:
//! create/attach a target, enable the page and network domains, navigate,
//! block on the caller's readiness condition while routing every inbound
//! frame through the network tracker, then collect HTML, response bodies,
//! a screenshot and normalized layout rects under the configured budgets.
//!
//! The session is strictly single-owner: all correlation state (pending
//! command id, request table, in-flight set) lives behind one `&mut` flow,
//! which is how the protocol's command/event multiplexing stays race-free.

pub mod capture;
pub mod engine;
pub mod metrics;
pub mod rects;
pub mod session;
pub mod transport;
pub mod wait;

pub use capture::CaptureLimits;
pub use config::CdpConfig;
pub use engine::CdpEngine;
pub use error::{SessionError, SessionErrorKind};
pub use session::CdpSession;
pub use transport::{CdpTransport, WsTransport};

pub mod error {
    use std::fmt;

    use thiserror::Error;

    /// Failure categories inside the protocol client.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
    pub enum SessionErrorKind {
        #[error("transport failure")]
        Transport,
        #[error("connection closed")]
        Closed,
        #[error("command timed out")]
        Timeout,
        #[error("protocol error")]
        Protocol,
        #[error("decode failure")]
        Decode,
    }

    /// Error with an optional human hint, in the adapter-error shape used
    /// across the workspace.
    #[derive(Clone, Debug)]
    pub struct SessionError {
        pub kind: SessionErrorKind,
        pub hint: Option<String>,
    }

    impl SessionError {
        pub fn new(kind: SessionErrorKind) -> Self {
            Self { kind, hint: None }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }
    }

    impl fmt::Display for SessionError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for SessionError {}

    impl From<SessionError> for pagesnap_core_types::EngineError {
        fn from(err: SessionError) -> Self {
            use pagesnap_core_types::EngineError;
            match err.kind {
                SessionErrorKind::Transport
                | SessionErrorKind::Closed
                | SessionErrorKind::Timeout => EngineError::Fetch(err.to_string()),
                SessionErrorKind::Protocol | SessionErrorKind::Decode => {
                    EngineError::Protocol(err.to_string())
                }
            }
        }
    }
}

pub mod config {
    use std::env;

    use serde::{Deserialize, Serialize};

    /// Connection and tuning knobs for the protocol client.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct CdpConfig {
        /// DevTools websocket endpoint, e.g. `ws://127.0.0.1:9222/devtools/browser/<id>`.
        pub websocket_url: Option<String>,
        /// Per-command response deadline in milliseconds.
        pub command_deadline_ms: u64,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                websocket_url: resolve_ws_url(),
                command_deadline_ms: 10_000,
            }
        }
    }

    fn resolve_ws_url() -> Option<String> {
        match env::var("PAGESNAP_WS_URL") {
            Ok(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(_) => None,
        }
    }
}
