//! Response-body and screenshot capture policy.
//!
//! After the wait condition settles, this module decides which response
//! bodies are worth fetching (MIME allow-list plus per-body, per-count and
//! total byte budgets) and attaches them to their tracker records. The
//! screenshot and layout metrics are captured best-effort: their absence
//! never fails a snapshot.

use std::collections::HashSet;
use std::env;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use once_cell::sync::Lazy;
use serde_json::json;
use tracing::debug;

use pagesnap_core_types::CaptureOptions;

use crate::session::CdpSession;
use crate::transport::CdpTransport;

/// Textual types captured when the caller does not restrict the allow-list.
const BUILTIN_ALLOWED: [&str; 6] = [
    "text/html",
    "text/plain",
    "text/css",
    "application/json",
    "application/javascript",
    "text/javascript",
];

const DEFAULT_MAX_BODIES: usize = 20;
const DEFAULT_MAX_BODY_BYTES: usize = 16_384;
const DEFAULT_MAX_TOTAL_BYTES: usize = 131_072;
/// Floor for the per-body budget; tiny budgets capture nothing useful.
const MIN_BODY_BYTES: usize = 512;

/// Process-wide environment defaults, read once.
static ENV_DEFAULTS: Lazy<CaptureLimits> = Lazy::new(CaptureLimits::from_env);

/// Effective capture budgets for one snapshot call.
#[derive(Clone, Debug)]
pub struct CaptureLimits {
    pub allowed_mimes: HashSet<String>,
    /// When the caller supplies an allow-list it is exact: the `text/*` and
    /// `*+json` fallbacks only apply to the default policy.
    pub exact_mimes: bool,
    pub max_bodies: usize,
    pub max_body_bytes: usize,
    pub max_total_bytes: usize,
}

impl CaptureLimits {
    fn from_env() -> Self {
        let mut allowed: HashSet<String> =
            BUILTIN_ALLOWED.iter().map(|mime| mime.to_string()).collect();
        if let Ok(raw) = env::var("PAGESNAP_BODY_MIME_ALLOW") {
            for entry in raw.split(',') {
                let entry = entry.trim().to_ascii_lowercase();
                if !entry.is_empty() {
                    allowed.insert(entry);
                }
            }
        }

        let limits = Self {
            allowed_mimes: allowed,
            exact_mimes: false,
            max_bodies: env_usize("PAGESNAP_BODY_MAX_COUNT", DEFAULT_MAX_BODIES),
            max_body_bytes: env_usize("PAGESNAP_BODY_MAX_BYTES", DEFAULT_MAX_BODY_BYTES),
            max_total_bytes: env_usize("PAGESNAP_BODY_TOTAL_MAX_BYTES", DEFAULT_MAX_TOTAL_BYTES),
        };
        limits.normalized()
    }

    /// Merge the process defaults with per-call options.
    pub fn resolve(options: Option<&CaptureOptions>) -> Self {
        let mut limits = ENV_DEFAULTS.clone();
        if let Some(options) = options {
            if let Some(allowed) = &options.allowed_mimes {
                limits.allowed_mimes = allowed
                    .iter()
                    .map(|mime| mime.to_ascii_lowercase())
                    .collect();
                limits.exact_mimes = true;
            }
            if let Some(max_bodies) = options.max_bodies {
                limits.max_bodies = max_bodies;
            }
            if let Some(max_body_bytes) = options.max_body_bytes {
                limits.max_body_bytes = max_body_bytes;
            }
            if let Some(max_total_bytes) = options.max_total_bytes {
                limits.max_total_bytes = max_total_bytes;
            }
        }
        limits.normalized()
    }

    fn normalized(mut self) -> Self {
        self.max_body_bytes = self.max_body_bytes.max(MIN_BODY_BYTES);
        self.max_total_bytes = self.max_total_bytes.max(self.max_body_bytes);
        self
    }

    /// Allow-list decision for one MIME type. The wire may report mixed
    /// case, so the input is lowercased before matching.
    pub fn mime_allowed(&self, mime: &str) -> bool {
        let mime = mime.to_ascii_lowercase();
        if self.allowed_mimes.contains(&mime) {
            return true;
        }
        !self.exact_mimes && (mime.starts_with("text/") || mime.ends_with("+json"))
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

/// Eligibility of one record before budgets: successful, allowed type, and
/// not declared larger than the per-body budget.
fn body_eligible(record: &network_track::RequestRecord, limits: &CaptureLimits) -> bool {
    let Some(mime) = record.mime_type.as_deref() else {
        return false;
    };
    if record.status.unwrap_or(0) >= 400 {
        return false;
    }
    if !limits.mime_allowed(mime) {
        return false;
    }
    if record
        .content_length
        .is_some_and(|length| length > limits.max_body_bytes as u64)
    {
        return false;
    }
    if record
        .encoded_length
        .is_some_and(|length| length > limits.max_body_bytes as u64)
    {
        return false;
    }
    true
}

/// Fetch and attach bodies for eligible records, in table insertion order
/// (first inserted wins when budgets are tight). The count and total-byte
/// budgets are hard caps. Individual fetch failures are skipped: bodies are
/// an enhancement, not a correctness requirement.
pub async fn capture_bodies<T: CdpTransport>(
    session: &mut CdpSession<T>,
    limits: &CaptureLimits,
) -> usize {
    let candidates: Vec<String> = session
        .tracker()
        .iter()
        .filter(|(_, record)| body_eligible(record, limits))
        .map(|(id, _)| id.to_string())
        .collect();

    let mut captured = 0usize;
    let mut total = 0usize;

    for request_id in candidates {
        if captured >= limits.max_bodies || total >= limits.max_total_bytes {
            break;
        }

        let (body, base64_encoded) = match session.get_response_body(&request_id).await {
            Ok(result) => result,
            Err(err) => {
                debug!(target: "cdp-capture", %request_id, %err, "body fetch failed");
                continue;
            }
        };

        let bytes = if base64_encoded {
            match STANDARD.decode(body.as_bytes()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(target: "cdp-capture", %request_id, %err, "base64 decode failed");
                    continue;
                }
            }
        } else {
            body.into_bytes()
        };

        let budget = limits.max_body_bytes.min(limits.max_total_bytes - total);
        let truncated = &bytes[..bytes.len().min(budget)];
        let Ok(text) = std::str::from_utf8(truncated) else {
            debug!(target: "cdp-capture", %request_id, "truncated body is not utf-8");
            continue;
        };

        let length = text.len();
        if session
            .tracker_mut()
            .attach_body(&request_id, text.to_string())
            .is_ok()
        {
            captured += 1;
            total += length;
        }
    }

    captured
}

/// Best-effort layout metrics and full-page screenshot.
#[derive(Clone, Debug, Default)]
pub struct PageVisuals {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub png: Option<Vec<u8>>,
    pub scale: Option<f32>,
}

pub async fn capture_page_visuals<T: CdpTransport>(session: &mut CdpSession<T>) -> PageVisuals {
    let mut visuals = PageVisuals {
        scale: Some(1.0),
        ..PageVisuals::default()
    };

    let metrics = match session.send_recv("Page.getLayoutMetrics", json!({})).await {
        Ok(metrics) => metrics,
        Err(err) => {
            debug!(target: "cdp-capture", %err, "layout metrics unavailable");
            return visuals;
        }
    };
    let content = metrics.get("contentSize");
    visuals.width = content
        .and_then(|size| size.get("width"))
        .and_then(serde_json::Value::as_f64)
        .map(|width| width.max(0.0) as u32);
    visuals.height = content
        .and_then(|size| size.get("height"))
        .and_then(serde_json::Value::as_f64)
        .map(|height| height.max(0.0) as u32);

    let shot = session
        .send_recv(
            "Page.captureScreenshot",
            json!({
                "format": "png",
                "captureBeyondViewport": true,
                "fromSurface": true
            }),
        )
        .await;
    match shot {
        Ok(result) => {
            visuals.png = result
                .get("data")
                .and_then(serde_json::Value::as_str)
                .and_then(|data| STANDARD.decode(data.as_bytes()).ok());
        }
        Err(err) => {
            debug!(target: "cdp-capture", %err, "screenshot unavailable");
        }
    }

    visuals
}

#[cfg(test)]
mod tests {
    use super::*;
    use network_track::RequestRecord;

    fn limits(allowed: &[&str], exact: bool) -> CaptureLimits {
        CaptureLimits {
            allowed_mimes: allowed.iter().map(|mime| mime.to_string()).collect(),
            exact_mimes: exact,
            max_bodies: 20,
            max_body_bytes: 16_384,
            max_total_bytes: 131_072,
        }
    }

    fn record(status: i64, mime: &str) -> RequestRecord {
        RequestRecord {
            url: "https://example.com/".into(),
            status: Some(status),
            mime_type: Some(mime.into()),
            ..RequestRecord::default()
        }
    }

    #[test]
    fn default_policy_keeps_textual_fallbacks() {
        let limits = limits(&["application/json"], false);
        assert!(limits.mime_allowed("text/markdown"));
        assert!(limits.mime_allowed("application/ld+json"));
        assert!(!limits.mime_allowed("image/png"));
    }

    #[test]
    fn exact_allowlist_disables_fallbacks() {
        let limits = limits(&["application/json"], true);
        assert!(limits.mime_allowed("application/json"));
        assert!(!limits.mime_allowed("text/html"));
        assert!(!limits.mime_allowed("application/ld+json"));
    }

    #[test]
    fn eligibility_rejects_errors_and_oversized_bodies() {
        let limits = limits(&["text/html"], false);
        assert!(body_eligible(&record(200, "text/html"), &limits));
        assert!(!body_eligible(&record(404, "text/html"), &limits));
        assert!(!body_eligible(&record(500, "text/html"), &limits));

        let mut large = record(200, "text/html");
        large.content_length = Some(1_000_000);
        assert!(!body_eligible(&large, &limits));

        let mut heavy_wire = record(200, "text/html");
        heavy_wire.encoded_length = Some(1_000_000);
        assert!(!body_eligible(&heavy_wire, &limits));

        let missing_mime = RequestRecord {
            status: Some(200),
            ..RequestRecord::default()
        };
        assert!(!body_eligible(&missing_mime, &limits));
    }

    #[test]
    fn unset_status_counts_as_success() {
        // Records that never saw a response event can still be eligible;
        // the body fetch itself will fail harmlessly if there is no body.
        let limits = limits(&["application/json"], true);
        let pending = RequestRecord {
            mime_type: Some("application/json".into()),
            ..RequestRecord::default()
        };
        assert!(body_eligible(&pending, &limits));
    }

    #[test]
    fn resolve_enforces_budget_floors() {
        let options = CaptureOptions {
            allowed_mimes: None,
            max_bodies: Some(3),
            max_body_bytes: Some(16),
            max_total_bytes: Some(1),
        };
        let limits = CaptureLimits::resolve(Some(&options));
        assert_eq!(limits.max_bodies, 3);
        assert_eq!(limits.max_body_bytes, MIN_BODY_BYTES);
        assert_eq!(limits.max_total_bytes, MIN_BODY_BYTES);
    }
}
