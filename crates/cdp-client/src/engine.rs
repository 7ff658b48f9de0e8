//! The DevTools-protocol snapshot engine.
//!
//! One `snapshot` call is one session: create and attach a target, enable
//! the Page and Network domains, navigate, honor the wait policy, then pull
//! the document, bodies, screenshot and layout rects before closing.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

use pagesnap_core_types::{
    text::strip_html, BrowserEngine, CaptureOptions, EngineError, NetworkRequest,
    NetworkRequestDetail, SnapshotResult, WaitPolicy, WaitStrategy,
};

use crate::capture::{capture_bodies, capture_page_visuals, CaptureLimits};
use crate::config::CdpConfig;
use crate::metrics;
use crate::rects::extract_block_rects;
use crate::session::CdpSession;
use crate::transport::CdpTransport;

/// Pause after the wait condition before reading the document, in ms.
/// Late layout shifts and consent overlays settle in this window.
const SETTLE_MS: u64 = 400;

/// Grace period appended to the quiet window when no explicit deadline
/// bounds the idle phase.
const IDLE_FALLBACK_GRACE_MS: u64 = 3_000;

/// Clicks the first visible consent/cookie button, if any. Failure is
/// harmless: the snapshot simply captures the overlay too.
const CONSENT_CLICK_JS: &str = r#"
(() => {
    const labels = ['accept', 'agree', 'allow all', 'got it', 'ok', 'consent',
                    'akzeptieren', 'accepter', 'aceptar'];
    const candidates = document.querySelectorAll(
        'button, [role="button"], input[type="button"], input[type="submit"]');
    for (const el of candidates) {
        const text = (el.innerText || el.value || '').trim().toLowerCase();
        if (!text || text.length > 40) { continue; }
        if (labels.some(l => text === l || text.startsWith(l + ' '))) {
            el.click();
            return true;
        }
    }
    return false;
})()
"#;

/// Sweeps the page once to trigger lazy-loaded content, then restores the
/// original scroll position so rects stay stable.
const LAZY_SCROLL_JS: &str = r#"
(() => {
    const original = window.scrollY;
    window.scrollTo(0, document.body.scrollHeight);
    window.scrollTo(0, original);
    return true;
})()
"#;

/// Engine backed by a remote DevTools websocket endpoint.
#[derive(Clone, Debug, Default)]
pub struct CdpEngine {
    cfg: CdpConfig,
}

impl CdpEngine {
    pub fn new(cfg: CdpConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl BrowserEngine for CdpEngine {
    async fn snapshot(
        &self,
        url: &str,
        wait: Option<WaitPolicy>,
        capture: Option<CaptureOptions>,
    ) -> Result<SnapshotResult, EngineError> {
        let parsed = Url::parse(url).map_err(|err| EngineError::InvalidUrl(err.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(EngineError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        metrics::record_snapshot();
        let wait = wait.unwrap_or_default();

        let mut session = CdpSession::open(&self.cfg).await?;
        let result = run_snapshot(&mut session, url, &wait, capture.as_ref()).await;
        session.close().await;

        let result = result?;
        info!(
            target: "cdp-engine",
            url,
            final_url = %result.final_url,
            load_ms = result.load_ms,
            "snapshot complete"
        );
        Ok(result)
    }
}

/// The full pipeline against an already-connected session. Split out from
/// `snapshot` so the transport can be substituted.
pub async fn run_snapshot<T: CdpTransport>(
    session: &mut CdpSession<T>,
    url: &str,
    wait: &WaitPolicy,
    capture: Option<&CaptureOptions>,
) -> Result<SnapshotResult, EngineError> {
    let target_id = session.create_target("about:blank").await?;
    session.attach(&target_id).await?;
    session.enable_page().await?;
    session.enable_network().await?;

    let started = Instant::now();
    session.navigate(url).await?;
    apply_wait_policy(session, wait).await?;

    // Best-effort settling: consent dismissal and a lazy-load sweep. The
    // snapshot proceeds unchanged when either script fails.
    if let Err(err) = session.evaluate(CONSENT_CLICK_JS).await {
        debug!(target: "cdp-engine", %err, "consent click failed");
    }
    tokio::time::sleep(Duration::from_millis(SETTLE_MS)).await;
    if let Err(err) = session.evaluate(LAZY_SCROLL_JS).await {
        debug!(target: "cdp-engine", %err, "lazy-load scroll failed");
    }

    let load_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let html = session.get_outer_html().await?;
    let text = strip_html(&html);

    let final_url = match session.current_url().await {
        Ok(Some(current)) => current,
        Ok(None) => url.to_string(),
        Err(err) => {
            debug!(target: "cdp-engine", %err, "navigation history unavailable");
            url.to_string()
        }
    };

    let limits = CaptureLimits::resolve(capture);
    let captured = capture_bodies(session, &limits).await;
    debug!(target: "cdp-engine", captured, "body capture done");

    let visuals = capture_page_visuals(session).await;
    let block_rects = extract_block_rects(session, visuals.width, visuals.height).await;

    let (network, network_detail) = summarize_network(session);
    let (page_status, page_content_type) = document_response(session, url, &final_url);

    Ok(SnapshotResult {
        html,
        text,
        final_url,
        load_ms: Some(load_ms),
        network: Some(network),
        page_status,
        page_content_type,
        network_detail: Some(network_detail),
        screenshot_png: visuals.png,
        screenshot_width: visuals.width,
        screenshot_height: visuals.height,
        screenshot_scale: visuals.scale,
        block_rects,
    })
}

/// Wait condition dispatch. Every branch is best-effort: a deadline that
/// expires leaves the page as-is and the snapshot continues.
async fn apply_wait_policy<T: CdpTransport>(
    session: &mut CdpSession<T>,
    wait: &WaitPolicy,
) -> Result<(), EngineError> {
    let max_wait = Duration::from_millis(wait.max_wait_ms());
    match wait.strategy {
        WaitStrategy::Load => {
            session.wait_for_load(max_wait).await?;
        }
        WaitStrategy::DomContentLoaded => {
            session.wait_for_dom_content(max_wait).await?;
        }
        WaitStrategy::NetworkIdle => {
            session.wait_for_load(max_wait).await?;
            if let Some(quiet_ms) = wait.network_idle_ms.filter(|quiet| *quiet > 0) {
                let idle_deadline_ms = wait
                    .max_wait_ms
                    .unwrap_or(quiet_ms + IDLE_FALLBACK_GRACE_MS);
                session
                    .wait_for_network_idle(
                        Duration::from_millis(quiet_ms),
                        Duration::from_millis(idle_deadline_ms),
                    )
                    .await?;
            }
        }
    }
    Ok(())
}

/// Public and diagnostic views of the tracker, in insertion order.
fn summarize_network<T: CdpTransport>(
    session: &CdpSession<T>,
) -> (Vec<NetworkRequest>, Vec<NetworkRequestDetail>) {
    let mut network = Vec::with_capacity(session.tracker().len());
    let mut detail = Vec::with_capacity(session.tracker().len());
    for (_, record) in session.tracker().iter() {
        network.push(NetworkRequest {
            url: record.url.clone(),
            resource_type: record.resource_type.clone(),
            status: record.status,
            body: record.body.clone(),
        });
        detail.push(NetworkRequestDetail {
            url: record.url.clone(),
            resource_type: record.resource_type.clone(),
            status: record.status,
            method: record.method.clone(),
            request_headers: record.request_headers.clone(),
            response_headers: record.response_headers.clone(),
        });
    }
    (network, detail)
}

/// Status and content type of the main document: the first document-type
/// record whose url matches the final or requested url, falling back to the
/// first document-type record.
fn document_response<T: CdpTransport>(
    session: &CdpSession<T>,
    requested_url: &str,
    final_url: &str,
) -> (Option<i64>, Option<String>) {
    let documents = session
        .tracker()
        .iter()
        .filter(|(_, record)| {
            record
                .resource_type
                .as_deref()
                .is_some_and(|kind| kind.eq_ignore_ascii_case("document"))
        })
        .map(|(_, record)| record);

    let mut first = None;
    for record in documents {
        if record.url == final_url || record.url == requested_url {
            return (record.status, record.mime_type.clone());
        }
        if first.is_none() {
            first = Some(record);
        }
    }
    match first {
        Some(record) => (record.status, record.mime_type.clone()),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let engine = CdpEngine::new(CdpConfig {
            websocket_url: Some("ws://127.0.0.1:9222/devtools".into()),
            ..CdpConfig::default()
        });
        let err = engine.snapshot("file:///etc/hosts", None, None).await;
        assert!(matches!(err, Err(EngineError::InvalidUrl(_))));
        let err = engine.snapshot("not a url", None, None).await;
        assert!(matches!(err, Err(EngineError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_fetch_error() {
        let engine = CdpEngine::new(CdpConfig {
            websocket_url: None,
            ..CdpConfig::default()
        });
        let err = engine.snapshot("https://example.com/", None, None).await;
        assert!(matches!(err, Err(EngineError::Fetch(_))));
    }
}
