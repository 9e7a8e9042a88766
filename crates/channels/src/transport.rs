//! Vendor wire seam. Adapters describe the HTTP call they would make; a
//! `Transport` executes it. The default transport simulates vendor replies so
//! the engine runs end to end without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct TransportRequest {
    /// Provider kind, e.g. `sendgrid` or `twilio_sms`.
    pub vendor: &'static str,
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    /// Forwarded to vendors that deduplicate retried requests.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request never reached the vendor (connect refused, DNS, TLS).
    #[error("vendor unreachable: {0}")]
    Unavailable(String),
    /// The request was sent but no reply arrived in time; the vendor may
    /// have accepted it.
    #[error("vendor request timed out")]
    Timeout,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Answers every request the way the vendor would on success, unless a
/// scripted reply is queued. Keeps a log of requests it has seen.
#[derive(Default)]
pub struct SimulatedTransport {
    scripted: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<TransportRequest>>,
    executed: AtomicU64,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next request; queued replies are used in order.
    pub fn push_reply(&self, reply: Result<TransportResponse, TransportError>) {
        self.scripted.lock().push_back(reply);
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().clone()
    }

    fn vendor_reply(request: &TransportRequest) -> TransportResponse {
        let token = Uuid::new_v4().simple().to_string();
        if request.method == "GET" {
            return TransportResponse::new(200, json!({"status": "ok"}));
        }
        match request.vendor {
            "sendgrid" => TransportResponse::new(202, Value::Null)
                .with_header("X-Message-Id", format!("sg{token}")),
            "aws_ses" => TransportResponse::new(200, json!({"MessageId": format!("ses-{token}")})),
            "smtp" => TransportResponse::new(250, json!({"message_id": format!("<{token}@relay>")})),
            "twilio_sms" | "twilio_whatsapp" => TransportResponse::new(
                201,
                json!({"sid": format!("SM{token}"), "status": "queued"}),
            ),
            "msg91" => TransportResponse::new(200, json!({"type": "success", "request_id": token})),
            "meta_whatsapp" => TransportResponse::new(
                200,
                json!({"messages": [{"id": format!("wamid.{token}")}]}),
            ),
            _ => TransportResponse::new(200, json!({"id": token})),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        let scripted = self.scripted.lock().pop_front();
        let reply = match scripted {
            Some(reply) => reply,
            None => Ok(Self::vendor_reply(&request)),
        };
        self.requests.lock().push(request);
        reply
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(vendor: &'static str) -> TransportRequest {
        TransportRequest {
            vendor,
            method: "POST",
            url: "https://vendor.test/send".to_string(),
            headers: Vec::new(),
            body: Value::Null,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_replies_take_precedence() {
        let transport = SimulatedTransport::new();
        transport.push_reply(Err(TransportError::Timeout));

        let first = transport.execute(request("sendgrid")).await;
        assert_eq!(first, Err(TransportError::Timeout));

        let second = transport.execute(request("sendgrid")).await.unwrap();
        assert_eq!(second.status, 202);
        assert!(second.header("x-message-id").is_some());
        assert_eq!(transport.executed(), 2);
        assert_eq!(transport.requests().len(), 2);
    }
}
