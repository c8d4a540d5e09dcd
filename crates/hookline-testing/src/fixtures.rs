//! Webhook request builders.
//!
//! Produce a body plus the headers a sender would attach, without tying the
//! tests to a particular HTTP client.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::signing::{sign_body, sign_timestamped};

/// Signature header name.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Event id header name.
pub const EVENT_ID_HEADER: &str = "x-webhook-event-id";
/// Timestamp header name.
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// A built webhook request.
#[derive(Debug, Clone)]
pub struct TestWebhook {
    /// Raw request body.
    pub body: Bytes,
    /// Headers to send, lower-case names.
    pub headers: Vec<(&'static str, String)>,
}

impl TestWebhook {
    /// Value of `name`, if set.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| *n == name).map(|(_, v)| v.as_str())
    }
}

enum Signing {
    None,
    Body(Vec<u8>),
    Timestamped(Vec<u8>, i64),
    Raw(String),
}

/// Builder for test webhook requests.
pub struct WebhookBuilder {
    event_id: Option<String>,
    body: Bytes,
    signing: Signing,
}

impl Default for WebhookBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookBuilder {
    /// Unsigned request with body `{"id":"evt_1","x":1}` and no event id.
    pub fn new() -> Self {
        Self {
            event_id: None,
            body: Bytes::from_static(br#"{"id":"evt_1","x":1}"#),
            signing: Signing::None,
        }
    }

    /// Sets the event id header.
    #[must_use]
    pub fn event_id(mut self, id: impl Into<String>) -> Self {
        self.event_id = Some(id.into());
        self
    }

    /// Sets the raw body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn json(self, value: &Value) -> Self {
        self.body(value.to_string())
    }

    /// JSON body `{"id": id, "seq": seq}`, handy for generating many events.
    #[must_use]
    pub fn numbered(self, id: &str, seq: u64) -> Self {
        self.json(&json!({ "id": id, "seq": seq }))
    }

    /// Signs the body with `secret`.
    #[must_use]
    pub fn signed(mut self, secret: &[u8]) -> Self {
        self.signing = Signing::Body(secret.to_vec());
        self
    }

    /// Signs `"{timestamp}.{body}"` with `secret` and sends the timestamp.
    #[must_use]
    pub fn signed_at(mut self, secret: &[u8], timestamp: i64) -> Self {
        self.signing = Signing::Timestamped(secret.to_vec(), timestamp);
        self
    }

    /// Sends `signature` verbatim.
    #[must_use]
    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signing = Signing::Raw(signature.into());
        self
    }

    /// Builds the request.
    pub fn build(self) -> TestWebhook {
        let mut headers = vec![("content-type", "application/json".to_string())];
        if let Some(id) = self.event_id {
            headers.push((EVENT_ID_HEADER, id));
        }
        match self.signing {
            Signing::None => {},
            Signing::Body(secret) => {
                headers.push((SIGNATURE_HEADER, sign_body(&secret, &self.body)));
            },
            Signing::Timestamped(secret, timestamp) => {
                headers.push((TIMESTAMP_HEADER, timestamp.to_string()));
                headers.push((SIGNATURE_HEADER, sign_timestamped(&secret, timestamp, &self.body)));
            },
            Signing::Raw(signature) => headers.push((SIGNATURE_HEADER, signature)),
        }
        TestWebhook { body: self.body, headers }
    }
}
