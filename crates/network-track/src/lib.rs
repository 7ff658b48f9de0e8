//! Per-session network activity tracking for pagesnap.
//!
//! The tracker keeps one record per protocol-assigned request id and an
//! in-flight id set, fed purely by the four DevTools network events. Handlers
//! are state merges: later events refine fields without discarding earlier
//! ones, so they stay idempotent and tolerate whatever interleaving the wire
//! produces. The tracker is single-owner state inside one session; it is
//! never shared across sessions.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

#[derive(Clone, Debug, Error)]
pub enum TrackError {
    #[error("unknown request id: {0}")]
    UnknownRequest(String),
}

/// One tracked request. Created on `requestWillBeSent`, refined in place by
/// the later events, retained for the life of the session.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequestRecord {
    pub url: String,
    pub resource_type: Option<String>,
    pub status: Option<i64>,
    pub mime_type: Option<String>,
    /// Populated only by the capture policy, never by event routing.
    pub body: Option<String>,
    pub encoded_length: Option<u64>,
    pub content_length: Option<u64>,
    pub method: Option<String>,
    pub request_headers: Option<HashMap<String, String>>,
    pub response_headers: Option<HashMap<String, String>>,
}

/// The network events the tracker understands, parsed from raw CDP frames.
#[derive(Clone, Debug)]
pub enum NetEvent {
    RequestWillBeSent {
        request_id: String,
        url: String,
        resource_type: Option<String>,
        method: Option<String>,
        headers: Option<HashMap<String, String>>,
    },
    ResponseReceived {
        request_id: String,
        status: Option<i64>,
        mime_type: Option<String>,
        url: Option<String>,
        resource_type: Option<String>,
        headers: Option<HashMap<String, String>>,
    },
    LoadingFinished {
        request_id: String,
        encoded_length: Option<u64>,
    },
    LoadingFailed {
        request_id: String,
    },
}

impl NetEvent {
    /// Parse a CDP event into a tracker event. Returns `None` for every
    /// method the tracker does not care about.
    pub fn from_cdp(method: &str, params: &Value) -> Option<NetEvent> {
        let request_id = params.get("requestId")?.as_str()?.to_string();
        match method {
            "Network.requestWillBeSent" => {
                let request = params.get("request")?;
                let url = request.get("url")?.as_str()?.to_string();
                Some(NetEvent::RequestWillBeSent {
                    request_id,
                    url,
                    resource_type: string_field(params, "type"),
                    method: string_field(request, "method"),
                    headers: header_map(request.get("headers")),
                })
            }
            "Network.responseReceived" => {
                let response = params.get("response")?;
                Some(NetEvent::ResponseReceived {
                    request_id,
                    status: response.get("status").and_then(Value::as_i64),
                    mime_type: string_field(response, "mimeType"),
                    url: string_field(response, "url"),
                    resource_type: string_field(params, "type"),
                    headers: header_map(response.get("headers")),
                })
            }
            "Network.loadingFinished" => Some(NetEvent::LoadingFinished {
                request_id,
                encoded_length: params
                    .get("encodedDataLength")
                    .and_then(Value::as_f64)
                    .map(|len| len.max(0.0) as u64),
            }),
            "Network.loadingFailed" => Some(NetEvent::LoadingFailed { request_id }),
            _ => None,
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// CDP header objects may carry non-string values; stringify everything.
fn header_map(value: Option<&Value>) -> Option<HashMap<String, String>> {
    let object = value?.as_object()?;
    let mut headers = HashMap::with_capacity(object.len());
    for (name, raw) in object {
        let rendered = match raw {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        headers.insert(name.clone(), rendered);
    }
    Some(headers)
}

/// Parse a numeric content-length out of a stringified header map.
fn content_length_of(headers: &HashMap<String, String>) -> Option<u64> {
    headers.iter().find_map(|(name, value)| {
        name.eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse::<u64>().ok())
            .flatten()
    })
}

/// Insertion-ordered request table plus the in-flight id set.
///
/// Invariant: the in-flight set is always a subset of the table's key set.
#[derive(Debug, Default)]
pub struct RequestTracker {
    records: HashMap<String, RequestRecord>,
    order: Vec<String>,
    inflight: HashSet<String>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event to the table. Unknown ids are created on the fly so
    /// arrival order never matters for the fields an event does set.
    pub fn observe(&mut self, event: NetEvent) {
        match event {
            NetEvent::RequestWillBeSent {
                request_id,
                url,
                resource_type,
                method,
                headers,
            } => {
                let record = self.entry(&request_id);
                record.url = url;
                if resource_type.is_some() {
                    record.resource_type = resource_type;
                }
                if method.is_some() {
                    record.method = method;
                }
                if headers.is_some() {
                    record.request_headers = headers;
                }
                self.inflight.insert(request_id);
            }
            NetEvent::ResponseReceived {
                request_id,
                status,
                mime_type,
                url,
                resource_type,
                headers,
            } => {
                let record = self.entry(&request_id);
                if status.is_some() {
                    record.status = status;
                }
                if mime_type.is_some() {
                    record.mime_type = mime_type;
                }
                if resource_type.is_some() {
                    record.resource_type = resource_type;
                }
                if let Some(url) = url {
                    if record.url.is_empty() {
                        record.url = url;
                    }
                }
                if let Some(headers) = headers {
                    if let Some(length) = content_length_of(&headers) {
                        record.content_length = Some(length);
                    }
                    record.response_headers = Some(headers);
                }
            }
            NetEvent::LoadingFinished {
                request_id,
                encoded_length,
            } => {
                if encoded_length.is_some() {
                    self.entry(&request_id).encoded_length = encoded_length;
                }
                self.inflight.remove(&request_id);
            }
            NetEvent::LoadingFailed { request_id } => {
                // Record is retained with whatever was captured so far.
                trace!(target: "network-track", %request_id, "loading failed");
                self.inflight.remove(&request_id);
            }
        }
    }

    fn entry(&mut self, request_id: &str) -> &mut RequestRecord {
        if !self.records.contains_key(request_id) {
            self.order.push(request_id.to_string());
            self.records
                .insert(request_id.to_string(), RequestRecord::default());
        }
        self.records
            .get_mut(request_id)
            .expect("record inserted above")
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// True once every observed request has finished or failed.
    pub fn is_idle(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn get(&self, request_id: &str) -> Option<&RequestRecord> {
        self.records.get(request_id)
    }

    /// Attach a captured body. Reserved for the capture policy.
    pub fn attach_body(&mut self, request_id: &str, body: String) -> Result<(), TrackError> {
        let record = self
            .records
            .get_mut(request_id)
            .ok_or_else(|| TrackError::UnknownRequest(request_id.to_string()))?;
        record.body = Some(body);
        Ok(())
    }

    /// Records in insertion order, the order the capture policy consumes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RequestRecord)> {
        self.order.iter().filter_map(move |id| {
            self.records
                .get(id)
                .map(|record| (id.as_str(), record))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sent(id: &str, url: &str) -> NetEvent {
        NetEvent::from_cdp(
            "Network.requestWillBeSent",
            &json!({
                "requestId": id,
                "type": "Document",
                "request": {
                    "url": url,
                    "method": "GET",
                    "headers": { "Accept": "text/html" }
                }
            }),
        )
        .expect("request event parses")
    }

    fn received(id: &str, status: i64, mime: &str, content_length: Value) -> NetEvent {
        NetEvent::from_cdp(
            "Network.responseReceived",
            &json!({
                "requestId": id,
                "type": "Document",
                "response": {
                    "url": "https://example.com/",
                    "status": status,
                    "mimeType": mime,
                    "headers": { "Content-Length": content_length }
                }
            }),
        )
        .expect("response event parses")
    }

    fn finished(id: &str, encoded: f64) -> NetEvent {
        NetEvent::from_cdp(
            "Network.loadingFinished",
            &json!({ "requestId": id, "encodedDataLength": encoded }),
        )
        .expect("finished event parses")
    }

    #[test]
    fn full_lifecycle_merges_fields() {
        let mut tracker = RequestTracker::new();
        tracker.observe(sent("r1", "https://example.com/"));
        assert_eq!(tracker.inflight_len(), 1);

        tracker.observe(received("r1", 200, "text/html", json!("1234")));
        tracker.observe(finished("r1", 2048.0));

        let record = tracker.get("r1").expect("record exists");
        assert_eq!(record.url, "https://example.com/");
        assert_eq!(record.status, Some(200));
        assert_eq!(record.mime_type.as_deref(), Some("text/html"));
        assert_eq!(record.method.as_deref(), Some("GET"));
        assert_eq!(record.content_length, Some(1234));
        assert_eq!(record.encoded_length, Some(2048));
        assert!(tracker.is_idle());
    }

    #[test]
    fn response_before_request_still_builds_a_record() {
        let mut tracker = RequestTracker::new();
        tracker.observe(received("r9", 304, "text/css", json!(77)));
        let record = tracker.get("r9").expect("record exists");
        assert_eq!(record.status, Some(304));
        assert_eq!(record.url, "https://example.com/");
        assert_eq!(record.content_length, Some(77));
        // Response alone never marks a request in flight.
        assert!(tracker.is_idle());
    }

    #[test]
    fn failed_requests_leave_the_table_intact() {
        let mut tracker = RequestTracker::new();
        tracker.observe(sent("r1", "https://example.com/a"));
        tracker.observe(
            NetEvent::from_cdp("Network.loadingFailed", &json!({ "requestId": "r1" }))
                .expect("failed event parses"),
        );
        assert!(tracker.is_idle());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get("r1").is_some());
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut tracker = RequestTracker::new();
        for id in ["a", "b", "c", "d"] {
            tracker.observe(sent(id, &format!("https://example.com/{id}")));
        }
        let ids: Vec<&str> = tracker.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn unrelated_methods_are_ignored() {
        assert!(NetEvent::from_cdp("Page.loadEventFired", &json!({})).is_none());
        assert!(NetEvent::from_cdp(
            "Network.dataReceived",
            &json!({ "requestId": "r1", "dataLength": 10 })
        )
        .is_none());
    }

    #[test]
    fn attach_body_rejects_unknown_ids() {
        let mut tracker = RequestTracker::new();
        assert!(tracker.attach_body("missing", "x".into()).is_err());
        tracker.observe(sent("r1", "https://example.com/"));
        tracker.attach_body("r1", "hello".into()).expect("attaches");
        assert_eq!(tracker.get("r1").unwrap().body.as_deref(), Some("hello"));
    }
}
