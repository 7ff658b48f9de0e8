//! Shared primitives for the pagesnap snapshot pipeline.
//!
//! This crate carries the data model exchanged between the capability surface
//! and the engines: the snapshot output, per-call wait/capture policies, and
//! the `BrowserEngine` trait that every engine (plain HTTP fetch, local
//! process fetch, DevTools-protocol client) implements.

pub mod text;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure categories surfaced to capability callers.
///
/// Finer causes (which command failed, transport vs. decode) stay inside the
/// engines; callers only need to distinguish bad input, unreachable pages and
/// protocol-level breakage.
#[derive(Clone, Debug, Error)]
pub enum EngineError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
}

/// Page readiness strategy for one snapshot call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum WaitStrategy {
    #[default]
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

/// Caller-specified condition and deadline for declaring a page ready.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WaitPolicy {
    #[serde(default)]
    pub strategy: WaitStrategy,
    /// Quiet period for `networkidle`, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_idle_ms: Option<u64>,
    /// Reserved: CSS selector readiness. Carried through, unused by the core
    /// strategies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

impl WaitPolicy {
    pub const DEFAULT_MAX_WAIT_MS: u64 = 5_000;

    pub fn max_wait_ms(&self) -> u64 {
        self.max_wait_ms.unwrap_or(Self::DEFAULT_MAX_WAIT_MS)
    }
}

/// Byte/count budgets and MIME allow-list governing response-body capture.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CaptureOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_mimes: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bodies: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_total_bytes: Option<usize>,
}

/// Public view of one tracked network request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub url: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Diagnostics view of one tracked network request, full headers included.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkRequestDetail {
    pub url: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
}

/// Layout rectangle expressed as page-size-relative fractions.
///
/// All coordinates are clamped to `[0, 1]` at construction time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Output of one capability call. Immutable once constructed.
///
/// `html`, `text` and `final_url` are always present; everything else is
/// best-effort and may be absent without the call having failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub html: String,
    pub text: String,
    pub final_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Vec<NetworkRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_detail: Option<Vec<NetworkRequestDetail>>,
    #[serde(
        with = "png_base64",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub screenshot_png: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_scale: Option<f32>,
    /// Normalized rects keyed by block id ("h0", "p0", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_rects: Option<HashMap<String, Vec<NormalizedRect>>>,
}

impl SnapshotResult {
    /// Minimal result for engines that only produce html/text.
    pub fn bare(html: String, text: String, final_url: String, load_ms: Option<u64>) -> Self {
        Self {
            html,
            text,
            final_url,
            load_ms,
            network: None,
            page_status: None,
            page_content_type: None,
            network_detail: None,
            screenshot_png: None,
            screenshot_width: None,
            screenshot_height: None,
            screenshot_scale: None,
            block_rects: None,
        }
    }
}

/// Screenshot bytes travel as base64 in JSON.
mod png_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(data) => serializer.serialize_str(&STANDARD.encode(data)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Capability surface: one URL in, one structured snapshot out.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn snapshot(
        &self,
        url: &str,
        wait: Option<WaitPolicy>,
        capture: Option<CaptureOptions>,
    ) -> Result<SnapshotResult, EngineError>;

    /// Convenience wrapper returning only html and extracted text.
    async fn snapshot_html(&self, url: &str) -> Result<(String, String), EngineError> {
        let result = self.snapshot(url, None, None).await?;
        Ok((result.html, result.text))
    }
}

pub fn clamp_unit(value: f64) -> f32 {
    value.clamp(0.0, 1.0) as f32
}
