//! pagesnap library
//!
//! Exposes the engines for integration testing and embedding.

pub mod engines;

// Re-export commonly used types for external use
pub use cdp_client::{CdpConfig, CdpEngine};
pub use engines::{ShellEngine, UrlFetchEngine};
pub use pagesnap_core_types::{
    BrowserEngine, CaptureOptions, EngineError, SnapshotResult, WaitPolicy, WaitStrategy,
};
