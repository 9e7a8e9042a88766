use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use campaign_core::providers::ProviderSettings;
use campaign_core::types::FailureReason;

use crate::email::{SendGridAdapter, SesAdapter, SmtpAdapter};
use crate::registry::HealthStatus;
use crate::sms::{Msg91Adapter, TwilioSmsAdapter};
use crate::transport::{Transport, TransportError, TransportResponse};
use crate::whatsapp::{MetaWhatsAppAdapter, TwilioWhatsAppAdapter};

/// A rendered message ready for a vendor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    /// Task key of the step being delivered; sent as vendor metadata and as
    /// the idempotency key where supported.
    pub reference: String,
}

/// Uniform result of a send. Vendor-side rejections are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub success: bool,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub reason: Option<FailureReason>,
    /// The request did not reach the vendor, so a retry cannot double-send.
    pub retryable: bool,
}

impl SendResult {
    pub fn accepted(external_id: Option<String>) -> Self {
        Self {
            success: true,
            external_id,
            error: None,
            reason: None,
            retryable: false,
        }
    }

    pub fn rejected(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            error: Some(error.into()),
            reason: Some(reason),
            retryable: false,
        }
    }

    pub fn from_transport_error(err: &TransportError) -> Self {
        match err {
            TransportError::Unavailable(_) => Self {
                retryable: true,
                ..Self::rejected(FailureReason::Transient, err.to_string())
            },
            TransportError::Timeout => Self::rejected(FailureReason::Timeout, err.to_string()),
        }
    }

    /// The stable failure code, `transient` when the adapter gave none.
    pub fn failure_reason(&self) -> FailureReason {
        self.reason.unwrap_or(FailureReason::Transient)
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider kind this adapter speaks, matching `ProviderCredentials::kind`.
    fn kind(&self) -> &'static str;

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult;

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus;
}

/// Extract a vendor error description from a JSON reply body.
pub(crate) fn vendor_error_text(response: &TransportResponse) -> String {
    let body = &response.body;
    let text = body["errors"][0]["message"]
        .as_str()
        .or_else(|| body["error"]["message"].as_str())
        .or_else(|| body["message"].as_str())
        .or_else(|| body["Message"].as_str())
        .or_else(|| body["error"].as_str());
    match text {
        Some(text) => format!("HTTP {}: {}", response.status, text),
        None => format!("HTTP {}", response.status),
    }
}

/// Map a health check reply to a status.
pub(crate) fn health_from(reply: Result<TransportResponse, TransportError>) -> HealthStatus {
    match reply {
        Ok(resp) if resp.is_success() => HealthStatus::Healthy,
        _ => HealthStatus::Unhealthy,
    }
}

pub fn is_valid_email(address: &str) -> bool {
    let address = address.trim();
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !address.contains(char::is_whitespace)
}

/// Normalise a phone number to `+digits`, accepting spaces, dashes and
/// parentheses as separators. Returns `None` unless 8 to 15 digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => return None,
        }
    }
    if !(8..=15).contains(&digits.len()) {
        return None;
    }
    Some(format!("+{digits}"))
}

/// Adapters indexed by provider kind.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<&'static str, Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in vendor adapter, all sharing one transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let mut set = Self::new();
        set.insert(Arc::new(SendGridAdapter::new(transport.clone())));
        set.insert(Arc::new(SesAdapter::new(transport.clone())));
        set.insert(Arc::new(SmtpAdapter::new(transport.clone())));
        set.insert(Arc::new(TwilioSmsAdapter::new(transport.clone())));
        set.insert(Arc::new(Msg91Adapter::new(transport.clone())));
        set.insert(Arc::new(MetaWhatsAppAdapter::new(transport.clone())));
        set.insert(Arc::new(TwilioWhatsAppAdapter::new(transport)));
        set
    }

    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn for_provider(&self, provider: &ProviderSettings) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider.credentials.kind()).cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
