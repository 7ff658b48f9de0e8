//! End-to-end pipeline tests against a scripted transport.
//!
//! The transport answers each outgoing command from a per-method script and
//! can interleave protocol events ahead of responses, which is the exact
//! frame ordering a real DevTools endpoint produces.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use cdp_client::capture::{capture_bodies, CaptureLimits};
use cdp_client::engine::run_snapshot;
use cdp_client::{CdpConfig, CdpSession, CdpTransport, SessionError, SessionErrorKind};
use pagesnap_core_types::{EngineError, WaitPolicy, WaitStrategy};

#[derive(Default)]
struct ScriptedTransport {
    inbox: VecDeque<String>,
    results: HashMap<String, VecDeque<Value>>,
    failures: HashSet<String>,
    /// Methods that never get a response at all.
    silent: HashSet<String>,
    /// Event frames queued right after the named method's response.
    events_after: HashMap<String, Vec<Value>>,
}

impl ScriptedTransport {
    fn respond(mut self, method: &str, result: Value) -> Self {
        self.results
            .entry(method.to_string())
            .or_default()
            .push_back(result);
        self
    }

    fn fail(mut self, method: &str) -> Self {
        self.failures.insert(method.to_string());
        self
    }

    fn silence(mut self, method: &str) -> Self {
        self.silent.insert(method.to_string());
        self
    }

    fn events_after(mut self, method: &str, events: Vec<Value>) -> Self {
        self.events_after.insert(method.to_string(), events);
        self
    }

    fn push_raw(&mut self, raw: impl Into<String>) {
        self.inbox.push_back(raw.into());
    }
}

#[async_trait]
impl CdpTransport for ScriptedTransport {
    async fn connect(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn send(&mut self, frame: &str) -> Result<(), SessionError> {
        let message: Value = serde_json::from_str(frame).expect("outgoing frames are json");
        let id = message["id"].as_i64().expect("outgoing frames carry an id");
        let method = message["method"].as_str().expect("method").to_string();

        if self.silent.contains(&method) {
            return Ok(());
        }
        if self.failures.contains(&method) {
            self.inbox.push_back(
                json!({
                    "id": id,
                    "error": { "code": -32000, "message": "scripted failure" }
                })
                .to_string(),
            );
            return Ok(());
        }

        let result = self
            .results
            .get_mut(&method)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| json!({}));
        self.inbox
            .push_back(json!({ "id": id, "result": result }).to_string());

        if let Some(events) = self.events_after.remove(&method) {
            for event in events {
                self.inbox.push_back(event.to_string());
            }
        }
        Ok(())
    }

    async fn recv(&mut self, max_wait: Duration) -> Result<Option<String>, SessionError> {
        if let Some(frame) = self.inbox.pop_front() {
            return Ok(Some(frame));
        }
        tokio::time::sleep(max_wait.min(Duration::from_millis(5))).await;
        Ok(self.inbox.pop_front())
    }

    async fn close(&mut self) {}
}

fn session_with(transport: ScriptedTransport) -> CdpSession<ScriptedTransport> {
    CdpSession::with_transport(transport, CdpConfig::default())
}

fn request_will_be_sent(id: &str, url: &str, kind: &str) -> Value {
    json!({
        "method": "Network.requestWillBeSent",
        "params": {
            "requestId": id,
            "type": kind,
            "request": { "url": url, "method": "GET", "headers": { "Accept": "*/*" } }
        }
    })
}

fn response_received(id: &str, url: &str, kind: &str, status: i64, mime: &str) -> Value {
    json!({
        "method": "Network.responseReceived",
        "params": {
            "requestId": id,
            "type": kind,
            "response": {
                "url": url,
                "status": status,
                "mimeType": mime,
                "headers": { "Content-Type": mime }
            }
        }
    })
}

fn loading_finished(id: &str, encoded: f64) -> Value {
    json!({
        "method": "Network.loadingFinished",
        "params": { "requestId": id, "encodedDataLength": encoded }
    })
}

#[tokio::test]
async fn events_interleaved_before_a_response_are_still_routed() {
    let mut transport = ScriptedTransport::default();
    // Two event frames land ahead of the awaited response, as the endpoint
    // is free to do.
    transport.push_raw(
        request_will_be_sent("req-1", "https://example.com/app.js", "Script").to_string(),
    );
    transport.push_raw(
        response_received("req-1", "https://example.com/app.js", "Script", 200, "text/javascript")
            .to_string(),
    );

    let mut session = session_with(transport);
    let result = session
        .send_recv("Network.enable", json!({}))
        .await
        .expect("command succeeds past interleaved events");
    assert_eq!(result, json!({}));

    let record = session.tracker().get("req-1").expect("event was tracked");
    assert_eq!(record.url, "https://example.com/app.js");
    assert_eq!(record.status, Some(200));
    assert_eq!(session.tracker().inflight_len(), 1);
}

#[tokio::test]
async fn error_responses_fail_the_command() {
    let transport = ScriptedTransport::default().fail("Page.navigate");
    let mut session = session_with(transport);
    let err = session
        .send_recv("Page.navigate", json!({ "url": "https://example.com/" }))
        .await
        .expect_err("scripted error surfaces");
    assert_eq!(err.kind, SessionErrorKind::Protocol);
    assert!(err.hint.unwrap().contains("scripted failure"));
}

#[tokio::test]
async fn a_silent_endpoint_times_out() {
    let transport = ScriptedTransport::default().silence("Page.enable");
    let cfg = CdpConfig {
        command_deadline_ms: 60,
        ..CdpConfig::default()
    };
    let mut session = CdpSession::with_transport(transport, cfg);
    let started = Instant::now();
    let err = session
        .send_recv("Page.enable", json!({}))
        .await
        .expect_err("no response within the deadline");
    assert_eq!(err.kind, SessionErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let mut transport = ScriptedTransport::default();
    transport.push_raw("this is not json");
    transport.push_raw("{\"also\": \"not a frame");
    let mut session = session_with(transport);
    session
        .send_recv("Network.enable", json!({}))
        .await
        .expect("garbage frames do not break correlation");
}

#[tokio::test]
async fn load_wait_degrades_to_false_at_the_deadline() {
    let mut session = session_with(ScriptedTransport::default());
    let fired = session
        .wait_for_load(Duration::from_millis(60))
        .await
        .expect("deadline is not an error");
    assert!(!fired);
}

#[tokio::test]
async fn network_idle_requires_a_continuous_quiet_window() {
    let mut session = session_with(ScriptedTransport::default());
    // Seed one request that has already finished; the set is idle from the
    // start, so the wait should return after roughly the quiet period.
    session.ingest(&request_will_be_sent("req-1", "https://example.com/", "Document").to_string());
    session.ingest(&loading_finished("req-1", 100.0).to_string());
    assert!(session.tracker().is_idle());

    let started = Instant::now();
    let idle = session
        .wait_for_network_idle(Duration::from_millis(50), Duration::from_millis(500))
        .await
        .expect("idle wait succeeds");
    assert!(idle);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));
}

fn pipeline_transport() -> ScriptedTransport {
    let doc_url = "https://example.com/";
    let final_url = "https://example.com/home";
    let rects_payload = json!([{
        "id": "h0",
        "kind": "h",
        "excerpt": "Hello",
        "rects": [{ "x": 120.0, "y": 240.0, "width": 600.0, "height": 48.0 }]
    }]);

    ScriptedTransport::default()
        .respond("Target.createTarget", json!({ "targetId": "tgt-1" }))
        .respond("Target.attachToTarget", json!({ "sessionId": "sess-1" }))
        .respond("Page.navigate", json!({ "frameId": "frame-1" }))
        .events_after(
            "Page.navigate",
            vec![
                request_will_be_sent("req-doc", doc_url, "Document"),
                response_received("req-doc", final_url, "Document", 200, "text/html"),
                loading_finished("req-doc", 2048.0),
                request_will_be_sent("req-api", "https://example.com/api", "XHR"),
                response_received(
                    "req-api",
                    "https://example.com/api",
                    "XHR",
                    200,
                    "application/json",
                ),
                loading_finished("req-api", 64.0),
                json!({ "method": "Page.loadEventFired", "params": { "timestamp": 1.0 } }),
            ],
        )
        // consent click, lazy-load sweep, block rects
        .respond("Runtime.evaluate", json!({ "result": { "value": false } }))
        .respond("Runtime.evaluate", json!({ "result": { "value": true } }))
        .respond("Runtime.evaluate", json!({ "result": { "value": rects_payload } }))
        .respond("DOM.getDocument", json!({ "root": { "nodeId": 1 } }))
        .respond(
            "DOM.getOuterHTML",
            json!({ "outerHTML": "<html><body><h1>Hello</h1><p>World</p></body></html>" }),
        )
        .respond(
            "Page.getNavigationHistory",
            json!({ "currentIndex": 0, "entries": [{ "url": final_url }] }),
        )
        .respond(
            "Network.getResponseBody",
            json!({ "body": "<html>doc</html>", "base64Encoded": false }),
        )
        .respond(
            "Network.getResponseBody",
            json!({ "body": "{\"ok\":true}", "base64Encoded": false }),
        )
        .respond(
            "Page.getLayoutMetrics",
            json!({ "contentSize": { "width": 1200.0, "height": 2400.0 } }),
        )
        .respond(
            "Page.captureScreenshot",
            json!({ "data": STANDARD.encode([0x89, b'P', b'N', b'G']) }),
        )
}

#[tokio::test]
async fn the_full_pipeline_produces_a_complete_snapshot() {
    let mut session = session_with(pipeline_transport());
    let wait = WaitPolicy {
        strategy: WaitStrategy::Load,
        max_wait_ms: Some(3_000),
        ..WaitPolicy::default()
    };

    let result = run_snapshot(&mut session, "https://example.com/", &wait, None)
        .await
        .expect("pipeline completes");

    assert!(result.html.contains("<h1>Hello</h1>"));
    assert_eq!(result.text, "Hello World");
    assert_eq!(result.final_url, "https://example.com/home");
    assert_eq!(result.page_status, Some(200));
    assert_eq!(result.page_content_type.as_deref(), Some("text/html"));
    assert!(result.load_ms.is_some());

    let network = result.network.expect("network summary present");
    assert_eq!(network.len(), 2);
    assert_eq!(network[0].url, "https://example.com/");
    assert_eq!(network[0].body.as_deref(), Some("<html>doc</html>"));
    assert_eq!(network[1].body.as_deref(), Some("{\"ok\":true}"));

    let detail = result.network_detail.expect("detail present");
    assert_eq!(detail[1].method.as_deref(), Some("GET"));
    assert!(detail[1].response_headers.is_some());

    assert_eq!(result.screenshot_width, Some(1200));
    assert_eq!(result.screenshot_height, Some(2400));
    assert_eq!(result.screenshot_scale, Some(1.0));
    assert_eq!(
        result.screenshot_png.as_deref(),
        Some(&[0x89, b'P', b'N', b'G'][..])
    );

    let rects = result.block_rects.expect("rects present");
    let h0 = &rects["h0"];
    assert_eq!(h0.len(), 1);
    assert_eq!(h0[0].x, 0.1);
    assert_eq!(h0[0].y, 0.1);
    assert_eq!(h0[0].w, 0.5);
    assert_eq!(h0[0].h, 0.02);
    assert_eq!(h0[0].excerpt.as_deref(), Some("Hello"));

    assert!(session.tracker().is_idle());
}

#[tokio::test]
async fn screenshot_failure_keeps_layout_metrics() {
    let mut session = session_with(pipeline_transport().fail("Page.captureScreenshot"));
    let wait = WaitPolicy {
        max_wait_ms: Some(3_000),
        ..WaitPolicy::default()
    };
    let result = run_snapshot(&mut session, "https://example.com/", &wait, None)
        .await
        .expect("screenshot is best-effort");
    assert!(result.screenshot_png.is_none());
    assert_eq!(result.screenshot_width, Some(1200));
    assert_eq!(result.screenshot_height, Some(2400));
    assert!(result.block_rects.is_some());
}

#[tokio::test]
async fn layout_metrics_failure_drops_visuals_and_rects() {
    let mut session = session_with(pipeline_transport().fail("Page.getLayoutMetrics"));
    let wait = WaitPolicy {
        max_wait_ms: Some(3_000),
        ..WaitPolicy::default()
    };
    let result = run_snapshot(&mut session, "https://example.com/", &wait, None)
        .await
        .expect("layout metrics are best-effort");
    assert!(result.screenshot_width.is_none());
    assert!(result.screenshot_height.is_none());
    assert!(result.block_rects.is_none());
    // The html/text core is unaffected.
    assert_eq!(result.text, "Hello World");
}

#[tokio::test]
async fn navigate_failure_fails_the_snapshot() {
    let mut session = session_with(pipeline_transport().fail("Page.navigate"));
    let wait = WaitPolicy::default();
    let err = run_snapshot(&mut session, "https://example.com/", &wait, None)
        .await
        .expect_err("navigation is mandatory");
    assert!(matches!(err, EngineError::Protocol(_)));
}

#[tokio::test]
async fn capture_budgets_are_hard_caps() {
    let transport = ScriptedTransport::default()
        .respond(
            "Network.getResponseBody",
            json!({ "body": "a".repeat(700), "base64Encoded": false }),
        )
        .respond(
            "Network.getResponseBody",
            json!({ "body": "b".repeat(700), "base64Encoded": false }),
        );
    let mut session = session_with(transport);
    for id in ["req-1", "req-2", "req-3"] {
        let url = format!("https://example.com/{id}");
        session.ingest(&request_will_be_sent(id, &url, "Document").to_string());
        session.ingest(&response_received(id, &url, "Document", 200, "text/html").to_string());
    }

    let limits = CaptureLimits {
        allowed_mimes: ["text/html".to_string()].into_iter().collect(),
        exact_mimes: true,
        max_bodies: 2,
        max_body_bytes: 600,
        max_total_bytes: 900,
    };
    let captured = capture_bodies(&mut session, &limits).await;
    assert_eq!(captured, 2);

    // First body truncates to the per-body budget, the second to what is
    // left of the total budget; the third is never fetched.
    let first = session.tracker().get("req-1").unwrap().body.as_deref().unwrap();
    let second = session.tracker().get("req-2").unwrap().body.as_deref().unwrap();
    assert_eq!(first.len(), 600);
    assert!(first.bytes().all(|b| b == b'a'));
    assert_eq!(second.len(), 300);
    assert!(second.bytes().all(|b| b == b'b'));
    assert!(session.tracker().get("req-3").unwrap().body.is_none());
    assert_eq!(first.len() + second.len(), limits.max_total_bytes);
}

#[tokio::test]
async fn max_bodies_limits_the_capture_count() {
    let transport = ScriptedTransport::default()
        .respond(
            "Network.getResponseBody",
            json!({ "body": "one", "base64Encoded": false }),
        );
    let mut session = session_with(transport);
    for id in ["req-1", "req-2"] {
        let url = format!("https://example.com/{id}");
        session.ingest(&request_will_be_sent(id, &url, "Document").to_string());
        session.ingest(&response_received(id, &url, "Document", 200, "text/html").to_string());
    }

    let limits = CaptureLimits {
        allowed_mimes: ["text/html".to_string()].into_iter().collect(),
        exact_mimes: true,
        max_bodies: 1,
        max_body_bytes: 16_384,
        max_total_bytes: 131_072,
    };
    let captured = capture_bodies(&mut session, &limits).await;
    assert_eq!(captured, 1);
    assert!(session.tracker().get("req-1").unwrap().body.is_some());
    assert!(session.tracker().get("req-2").unwrap().body.is_none());
}
