use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, trace};

use network_track::{NetEvent, RequestTracker};

use crate::config::CdpConfig;
use crate::error::{SessionError, SessionErrorKind};
use crate::metrics;
use crate::transport::{CdpTransport, WsTransport};

/// One attached command/event channel to a browser target.
///
/// The session owns the transport, the outgoing command id counter and the
/// request tracker. Commands are strictly sequential; the event router runs
/// for every inbound frame, whether or not a command is awaiting its id.
pub struct CdpSession<T: CdpTransport> {
    transport: T,
    cfg: CdpConfig,
    next_id: i64,
    tracker: RequestTracker,
    target_id: Option<String>,
    cdp_session_id: Option<String>,
    closed: bool,
}

impl CdpSession<WsTransport> {
    /// Connect a fresh session to the configured websocket endpoint.
    pub async fn open(cfg: &CdpConfig) -> Result<Self, SessionError> {
        let url = cfg.websocket_url.clone().ok_or_else(|| {
            SessionError::new(SessionErrorKind::Transport)
                .with_hint("no devtools websocket url configured")
        })?;
        let mut session = Self::with_transport(WsTransport::new(url), cfg.clone());
        session.connect().await?;
        Ok(session)
    }
}

impl<T: CdpTransport> CdpSession<T> {
    pub fn with_transport(transport: T, cfg: CdpConfig) -> Self {
        Self {
            transport,
            cfg,
            next_id: 1,
            tracker: RequestTracker::new(),
            target_id: None,
            cdp_session_id: None,
            closed: false,
        }
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.transport.connect().await
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut RequestTracker {
        &mut self.tracker
    }

    pub fn target_id(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    /// Session id returned by the flatten attach. Kept for diagnostics;
    /// outgoing commands never carry it.
    pub fn session_id(&self) -> Option<&str> {
        self.cdp_session_id.as_deref()
    }

    /// Route one raw inbound frame: decode, feed protocol events to the
    /// tracker, hand the decoded message back. Undecodable frames are
    /// swallowed (logged and counted); they can only be events nobody is
    /// waiting on.
    pub fn ingest(&mut self, raw: &str) -> Option<Value> {
        let message: Value = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(err) => {
                metrics::record_decode_failure();
                debug!(target: "cdp-session", %err, "dropping undecodable frame");
                return None;
            }
        };

        if let Some(method) = message.get("method").and_then(Value::as_str) {
            metrics::record_event();
            let params = message.get("params").unwrap_or(&Value::Null);
            if let Some(event) = NetEvent::from_cdp(method, params) {
                self.tracker.observe(event);
            } else {
                trace!(target: "cdp-session", method, "unhandled protocol event");
            }
        }

        Some(message)
    }

    /// Send one command and block until its matching response arrives.
    ///
    /// Every frame received while waiting is routed first, so events
    /// interleaved before the response are never lost. A response carrying
    /// an `error` field fails the call; the per-command deadline turns a
    /// silent endpoint into a timeout error instead of a hang.
    pub async fn send_recv(&mut self, method: &str, params: Value) -> Result<Value, SessionError> {
        let id = self.next_id;
        self.next_id += 1;

        let frame = json!({ "id": id, "method": method, "params": params }).to_string();
        metrics::record_command(method);
        let started = Instant::now();

        if let Err(err) = self.transport.send(&frame).await {
            metrics::record_command_failure(method);
            return Err(err);
        }

        let deadline = started + Duration::from_millis(self.cfg.command_deadline_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                metrics::record_command_failure(method);
                return Err(SessionError::new(SessionErrorKind::Timeout)
                    .with_hint(format!("no response for {method} (id {id})")));
            }

            let raw = match self.transport.recv(remaining).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    metrics::record_command_failure(method);
                    return Err(err);
                }
            };

            let Some(message) = self.ingest(&raw) else {
                continue;
            };
            if message.get("id").and_then(Value::as_i64) != Some(id) {
                continue;
            }

            if let Some(error) = message.get("error") {
                metrics::record_command_failure(method);
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                return Err(SessionError::new(SessionErrorKind::Protocol)
                    .with_hint(format!("{method} failed: {text} (code {code})")));
            }

            return match message.get("result") {
                Some(result) => {
                    metrics::record_command_success(method, started.elapsed());
                    Ok(result.clone())
                }
                None => {
                    metrics::record_command_failure(method);
                    Err(SessionError::new(SessionErrorKind::Protocol)
                        .with_hint(format!("{method} response missing result")))
                }
            };
        }
    }

    /// Idempotent teardown of the underlying socket.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.close().await;
        }
    }

    pub(crate) async fn recv_slice(
        &mut self,
        max_wait: Duration,
    ) -> Result<Option<String>, SessionError> {
        self.transport.recv(max_wait).await
    }

    // ---- typed command helpers -------------------------------------------

    pub async fn create_target(&mut self, url: &str) -> Result<String, SessionError> {
        let result = self
            .send_recv("Target.createTarget", json!({ "url": url }))
            .await?;
        let target_id = required_str(&result, "targetId", "Target.createTarget")?;
        self.target_id = Some(target_id.clone());
        Ok(target_id)
    }

    pub async fn attach(&mut self, target_id: &str) -> Result<(), SessionError> {
        let result = self
            .send_recv(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        self.cdp_session_id = Some(required_str(&result, "sessionId", "Target.attachToTarget")?);
        Ok(())
    }

    pub async fn enable_page(&mut self) -> Result<(), SessionError> {
        self.send_recv("Page.enable", json!({})).await.map(|_| ())
    }

    pub async fn enable_network(&mut self) -> Result<(), SessionError> {
        self.send_recv("Network.enable", json!({})).await.map(|_| ())
    }

    pub async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.send_recv("Page.navigate", json!({ "url": url }))
            .await
            .map(|_| ())
    }

    /// Full serialized document: DOM.getDocument then DOM.getOuterHTML.
    pub async fn get_outer_html(&mut self) -> Result<String, SessionError> {
        let document = self
            .send_recv("DOM.getDocument", json!({ "depth": -1 }))
            .await?;
        let node_id = document
            .get("root")
            .and_then(|root| root.get("nodeId"))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                SessionError::new(SessionErrorKind::Decode)
                    .with_hint("DOM.getDocument missing root.nodeId")
            })?;
        let outer = self
            .send_recv("DOM.getOuterHTML", json!({ "nodeId": node_id }))
            .await?;
        required_str(&outer, "outerHTML", "DOM.getOuterHTML")
    }

    /// Fire-and-check script evaluation; the value is discarded.
    pub async fn evaluate(&mut self, expression: &str) -> Result<(), SessionError> {
        self.send_recv("Runtime.enable", json!({})).await?;
        self.send_recv(
            "Runtime.evaluate",
            json!({ "expression": expression, "returnByValue": true }),
        )
        .await
        .map(|_| ())
    }

    /// Script evaluation returning the by-value result, when there is one.
    pub async fn eval_value(&mut self, expression: &str) -> Result<Option<Value>, SessionError> {
        self.send_recv("Runtime.enable", json!({})).await?;
        let result = self
            .send_recv(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true }),
            )
            .await?;
        Ok(result
            .get("result")
            .and_then(|inner| inner.get("value"))
            .cloned())
    }

    /// Response body plus its base64 flag.
    pub async fn get_response_body(
        &mut self,
        request_id: &str,
    ) -> Result<(String, bool), SessionError> {
        let result = self
            .send_recv(
                "Network.getResponseBody",
                json!({ "requestId": request_id }),
            )
            .await?;
        let body = required_str(&result, "body", "Network.getResponseBody")?;
        let base64_encoded = result
            .get("base64Encoded")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok((body, base64_encoded))
    }

    /// URL of the current history entry (post-redirect), when available.
    pub async fn current_url(&mut self) -> Result<Option<String>, SessionError> {
        let history = self
            .send_recv("Page.getNavigationHistory", json!({}))
            .await?;
        let index = history
            .get("currentIndex")
            .and_then(Value::as_i64)
            .unwrap_or(-1);
        let entries = history.get("entries").and_then(Value::as_array);
        let url = entries.and_then(|entries| {
            usize::try_from(index)
                .ok()
                .and_then(|index| entries.get(index))
                .and_then(|entry| entry.get("url"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(url)
    }
}

fn required_str(value: &Value, key: &str, method: &str) -> Result<String, SessionError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            SessionError::new(SessionErrorKind::Decode)
                .with_hint(format!("{method} missing {key}"))
        })
}
