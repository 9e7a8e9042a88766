//! SMS adapters: Twilio Programmable Messaging and MSG91.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tracing::{debug, warn};

use campaign_core::providers::{ProviderCredentials, ProviderSettings};
use campaign_core::types::FailureReason;

use crate::adapter::{
    health_from, normalize_phone, vendor_error_text, OutboundMessage, ProviderAdapter, SendResult,
};
use crate::registry::HealthStatus;
use crate::transport::{Transport, TransportRequest};

const TWILIO_API: &str = "https://api.twilio.com/2010-04-01";
const MSG91_API: &str = "https://control.msg91.com/api/v5";

pub(crate) fn twilio_basic_auth(account_sid: &str, auth_token: &str) -> String {
    let raw = format!("{account_sid}:{auth_token}");
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

/// Twilio error codes that mean the destination itself is unusable.
fn twilio_hint(code: Option<i64>) -> Option<&'static str> {
    match code? {
        21211 => Some("the 'To' number is not a valid phone number"),
        21408 => Some("SMS to this region is not enabled on the Twilio account"),
        21610 => Some("the recipient has opted out (STOP)"),
        21614 => Some("the 'To' number cannot receive SMS"),
        21606 => Some("the 'From' number is not SMS-capable on this account"),
        _ => None,
    }
}

pub struct TwilioSmsAdapter {
    transport: Arc<dyn Transport>,
}

impl TwilioSmsAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Number of SMS segments a body is billed as.
    /// GSM 7-bit: 160 chars single, 153 per part. UCS-2: 70 single, 67 per part.
    pub fn calculate_segments(body: &str) -> u32 {
        if body.is_empty() {
            return 1;
        }
        let char_count = body.chars().count() as u32;
        let (single, multi) = if body.chars().all(is_gsm_7bit) {
            (160, 153)
        } else {
            (70, 67)
        };
        if char_count <= single {
            1
        } else {
            char_count.div_ceil(multi)
        }
    }
}

#[async_trait]
impl ProviderAdapter for TwilioSmsAdapter {
    fn kind(&self) -> &'static str {
        "twilio_sms"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::TwilioSms {
            account_sid,
            auth_token,
            from_number,
            status_callback_url,
        } = &provider.credentials
        else {
            return SendResult::rejected(
                FailureReason::MissingCredentials,
                format!("provider '{}' is not a Twilio SMS provider", provider.name),
            );
        };
        let Some(to) = normalize_phone(&message.to) else {
            return SendResult::rejected(
                FailureReason::VendorRejected,
                format!("'{}' is not a valid phone number", message.to),
            );
        };

        let segments = Self::calculate_segments(&message.body);
        debug!(provider = %provider.name, to = %to, segments, "Sending SMS via Twilio");

        let mut form = json!({
            "To": to,
            "From": from_number,
            "Body": message.body,
        });
        if let Some(callback) = status_callback_url {
            form["StatusCallback"] = json!(callback);
        }

        let request = TransportRequest {
            vendor: self.kind(),
            method: "POST",
            url: format!("{TWILIO_API}/Accounts/{account_sid}/Messages.json"),
            headers: vec![
                (
                    "Authorization".to_string(),
                    twilio_basic_auth(account_sid, auth_token.expose()),
                ),
                (
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded".to_string(),
                ),
                ("I-Twilio-Idempotency-Token".to_string(), message.reference.clone()),
            ],
            body: form,
            idempotency_key: Some(message.reference.clone()),
        };

        match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => {
                metrics::histogram!("sms.segments").record(f64::from(segments));
                SendResult::accepted(resp.body["sid"].as_str().map(str::to_string))
            }
            Ok(resp) => {
                let text = vendor_error_text(&resp);
                warn!(provider = %provider.name, status = resp.status, "Twilio rejected SMS");
                let text = match twilio_hint(resp.body["code"].as_i64()) {
                    Some(hint) => format!("{text} ({hint})"),
                    None => text,
                };
                SendResult::rejected(FailureReason::VendorRejected, text)
            }
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::TwilioSms {
            account_sid,
            auth_token,
            ..
        } = &provider.credentials
        else {
            return HealthStatus::Unhealthy;
        };
        if !provider.credentials.has_minimum_credentials() {
            return HealthStatus::Unhealthy;
        }
        let request = TransportRequest {
            vendor: self.kind(),
            method: "GET",
            url: format!("{TWILIO_API}/Accounts/{account_sid}.json"),
            headers: vec![(
                "Authorization".to_string(),
                twilio_basic_auth(account_sid, auth_token.expose()),
            )],
            body: serde_json::Value::Null,
            idempotency_key: None,
        };
        health_from(self.transport.execute(request).await)
    }
}

pub struct Msg91Adapter {
    transport: Arc<dyn Transport>,
}

impl Msg91Adapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for Msg91Adapter {
    fn kind(&self) -> &'static str {
        "msg91"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::Msg91 {
            auth_key,
            sender_id,
            template_id,
        } = &provider.credentials
        else {
            return SendResult::rejected(
                FailureReason::MissingCredentials,
                format!("provider '{}' is not an MSG91 provider", provider.name),
            );
        };
        let Some(to) = normalize_phone(&message.to) else {
            return SendResult::rejected(
                FailureReason::VendorRejected,
                format!("'{}' is not a valid phone number", message.to),
            );
        };

        // MSG91 expects the number without the leading '+'.
        let mobile = to.trim_start_matches('+');
        let payload = match template_id {
            Some(template_id) => json!({
                "template_id": template_id,
                "sender": sender_id,
                "short_url": 0,
                "recipients": [{"mobiles": mobile, "body": message.body}]
            }),
            None => json!({
                "sender": sender_id,
                "route": "4",
                "sms": [{"message": message.body, "to": [mobile]}]
            }),
        };
        let path = if template_id.is_some() { "flow" } else { "sms" };

        let request = TransportRequest {
            vendor: self.kind(),
            method: "POST",
            url: format!("{MSG91_API}/{path}"),
            headers: vec![
                ("authkey".to_string(), auth_key.expose().to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: payload,
            idempotency_key: None,
        };

        match self.transport.execute(request).await {
            // MSG91 reports some rejections with HTTP 200 and type=error.
            Ok(resp) if resp.is_success() && resp.body["type"] != "error" => SendResult::accepted(
                resp.body["request_id"]
                    .as_str()
                    .or_else(|| resp.body["message"].as_str())
                    .map(str::to_string),
            ),
            Ok(resp) => SendResult::rejected(FailureReason::VendorRejected, vendor_error_text(&resp)),
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::Msg91 { auth_key, .. } = &provider.credentials else {
            return HealthStatus::Unhealthy;
        };
        if !provider.credentials.has_minimum_credentials() {
            return HealthStatus::Unhealthy;
        }
        let request = TransportRequest {
            vendor: self.kind(),
            method: "GET",
            url: format!("{MSG91_API}/balance"),
            headers: vec![("authkey".to_string(), auth_key.expose().to_string())],
            body: serde_json::Value::Null,
            idempotency_key: None,
        };
        health_from(self.transport.execute(request).await)
    }
}

/// Check whether a character is in the GSM 7-bit default alphabet or its
/// extension table.
fn is_gsm_7bit(c: char) -> bool {
    matches!(c,
        'A'..='Z' | 'a'..='z' | '0'..='9'
        | ' ' | '!' | '"' | '#' | '$' | '%' | '&' | '\'' | '(' | ')'
        | '*' | '+' | ',' | '-' | '.' | '/' | ':' | ';' | '<' | '='
        | '>' | '?' | '@' | '_' | '\n' | '\r'
        | '£' | '¥' | 'è' | 'é' | 'ù' | 'ì' | 'ò' | 'Ç' | 'Ø' | 'ø' | 'Å' | 'å'
        | 'Δ' | 'Φ' | 'Γ' | 'Λ' | 'Ω' | 'Π' | 'Ψ' | 'Σ' | 'Θ' | 'Ξ'
        | 'Æ' | 'æ' | 'ß' | 'É' | '¤' | '¡' | '¿'
        | 'Ä' | 'Ö' | 'Ñ' | 'Ü' | '§' | 'ä' | 'ö' | 'ñ' | 'ü' | 'à'
        | '{' | '}' | '[' | ']' | '~' | '\\' | '^' | '|' | '€'
    )
}
