//! Chat adapters: WhatsApp via the Meta Cloud API and via Twilio.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use campaign_core::providers::{ProviderCredentials, ProviderSettings};
use campaign_core::types::FailureReason;

use crate::adapter::{
    health_from, normalize_phone, vendor_error_text, OutboundMessage, ProviderAdapter, SendResult,
};
use crate::registry::HealthStatus;
use crate::sms::twilio_basic_auth;
use crate::transport::{Transport, TransportRequest};

const GRAPH_API: &str = "https://graph.facebook.com";
const TWILIO_API: &str = "https://api.twilio.com/2010-04-01";

fn invalid_number(to: &str) -> SendResult {
    SendResult::rejected(
        FailureReason::VendorRejected,
        format!("'{to}' is not a valid WhatsApp number"),
    )
}

pub struct MetaWhatsAppAdapter {
    transport: Arc<dyn Transport>,
    api_base_url: String,
}

impl MetaWhatsAppAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            api_base_url: GRAPH_API.to_string(),
        }
    }

    pub fn with_base_url(mut self, api_base_url: impl Into<String>) -> Self {
        self.api_base_url = api_base_url.into();
        self
    }
}

#[async_trait]
impl ProviderAdapter for MetaWhatsAppAdapter {
    fn kind(&self) -> &'static str {
        "meta_whatsapp"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::MetaWhatsapp {
            access_token,
            phone_number_id,
            api_version,
        } = &provider.credentials
        else {
            return SendResult::rejected(
                FailureReason::MissingCredentials,
                format!("provider '{}' is not a Meta WhatsApp provider", provider.name),
            );
        };
        let Some(to) = normalize_phone(&message.to) else {
            return invalid_number(&message.to);
        };

        debug!(provider = %provider.name, to = %to, "Sending WhatsApp text message");
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to.trim_start_matches('+'),
            "type": "text",
            "text": {"preview_url": false, "body": message.body},
            "biz_opaque_callback_data": message.reference
        });

        let request = TransportRequest {
            vendor: self.kind(),
            method: "POST",
            url: format!(
                "{}/{api_version}/{phone_number_id}/messages",
                self.api_base_url
            ),
            headers: vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", access_token.expose()),
                ),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: payload,
            idempotency_key: None,
        };

        match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => SendResult::accepted(
                resp.body["messages"][0]["id"].as_str().map(str::to_string),
            ),
            Ok(resp) => {
                warn!(provider = %provider.name, status = resp.status, "WhatsApp rejected message");
                // 131047: outside the 24h customer service window.
                let text = vendor_error_text(&resp);
                let text = if resp.body["error"]["code"].as_i64() == Some(131047) {
                    format!("{text} (free-form messages need an open 24h conversation; use an approved template)")
                } else {
                    text
                };
                SendResult::rejected(FailureReason::VendorRejected, text)
            }
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::MetaWhatsapp {
            access_token,
            phone_number_id,
            api_version,
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
            url: format!("{}/{api_version}/{phone_number_id}", self.api_base_url),
            headers: vec![(
                "Authorization".to_string(),
                format!("Bearer {}", access_token.expose()),
            )],
            body: serde_json::Value::Null,
            idempotency_key: None,
        };
        health_from(self.transport.execute(request).await)
    }
}

pub struct TwilioWhatsAppAdapter {
    transport: Arc<dyn Transport>,
}

impl TwilioWhatsAppAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn whatsapp_address(number: &str) -> String {
        let number = number.trim_start_matches("whatsapp:");
        format!("whatsapp:{number}")
    }
}

#[async_trait]
impl ProviderAdapter for TwilioWhatsAppAdapter {
    fn kind(&self) -> &'static str {
        "twilio_whatsapp"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::TwilioWhatsapp {
            account_sid,
            auth_token,
            from_number,
        } = &provider.credentials
        else {
            return SendResult::rejected(
                FailureReason::MissingCredentials,
                format!("provider '{}' is not a Twilio WhatsApp provider", provider.name),
            );
        };
        let Some(to) = normalize_phone(message.to.trim_start_matches("whatsapp:")) else {
            return invalid_number(&message.to);
        };

        let form = json!({
            "To": Self::whatsapp_address(&to),
            "From": Self::whatsapp_address(from_number),
            "Body": message.body,
        });
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
            ],
            body: form,
            idempotency_key: Some(message.reference.clone()),
        };

        match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => {
                SendResult::accepted(resp.body["sid"].as_str().map(str::to_string))
            }
            Ok(resp) => SendResult::rejected(FailureReason::VendorRejected, vendor_error_text(&resp)),
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::TwilioWhatsapp {
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::{SimulatedTransport, TransportResponse};
    use campaign_core::providers::Secret;
    use uuid::Uuid;

    fn meta_provider() -> ProviderSettings {
        ProviderSettings {
            id: Uuid::new_v4(),
            name: "wa-cloud".to_string(),
            credentials: ProviderCredentials::MetaWhatsapp {
                access_token: Secret::new("EAAG"),
                phone_number_id: "1098765".to_string(),
                api_version: "v18.0".to_string(),
            },
            daily_limit: 100,
            monthly_limit: 1000,
            priority: 1,
            is_default: true,
            is_active: true,
        }
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.to_string(),
            subject: None,
            body: "Your order shipped".to_string(),
            reference: "c:s:r".to_string(),
        }
    }

    #[tokio::test]
    async fn test_meta_send_returns_wamid() {
        let transport = Arc::new(SimulatedTransport::new());
        let adapter = MetaWhatsAppAdapter::new(transport.clone());
        let result = adapter.send(&meta_provider(), &message("+919876543210")).await;

        assert!(result.success);
        assert!(result.external_id.unwrap().starts_with("wamid."));
        let request = &transport.requests()[0];
        assert_eq!(request.body["to"], "919876543210");
        assert!(request.url.ends_with("/v18.0/1098765/messages"));
    }

    #[tokio::test]
    async fn test_meta_window_error_hint() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.push_reply(Ok(TransportResponse::new(
            400,
            json!({"error": {"code": 131047, "message": "Re-engagement message"}}),
        )));
        let adapter = MetaWhatsAppAdapter::new(transport);
        let result = adapter.send(&meta_provider(), &message("+919876543210")).await;
        assert!(result.error.unwrap().contains("approved template"));
    }

    #[tokio::test]
    async fn test_twilio_whatsapp_prefixes_addresses() {
        let transport = Arc::new(SimulatedTransport::new());
        let adapter = TwilioWhatsAppAdapter::new(transport.clone());
        let provider = ProviderSettings {
            credentials: ProviderCredentials::TwilioWhatsapp {
                account_sid: "AC1".to_string(),
                auth_token: Secret::new("tok"),
                from_number: "+14155238886".to_string(),
            },
            ..meta_provider()
        };
        let result = adapter.send(&provider, &message("whatsapp:+15550001111")).await;
        assert!(result.success);
        let request = &transport.requests()[0];
        assert_eq!(request.body["To"], "whatsapp:+15550001111");
        assert_eq!(request.body["From"], "whatsapp:+14155238886");
    }
}
