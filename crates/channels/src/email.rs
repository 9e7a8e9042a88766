//! Email adapters: SendGrid, AWS SES (v2 API) and a plain SMTP relay.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use campaign_core::providers::{ProviderCredentials, ProviderSettings};
use campaign_core::types::FailureReason;

use crate::adapter::{
    health_from, is_valid_email, vendor_error_text, OutboundMessage, ProviderAdapter, SendResult,
};
use crate::registry::HealthStatus;
use crate::transport::{Transport, TransportRequest, TransportResponse};

const SENDGRID_API: &str = "https://api.sendgrid.com/v3";

fn wrong_kind(provider: &ProviderSettings, expected: &str) -> SendResult {
    SendResult::rejected(
        FailureReason::MissingCredentials,
        format!(
            "provider '{}' is {} not {expected}",
            provider.name,
            provider.credentials.kind()
        ),
    )
}

fn invalid_address(to: &str) -> SendResult {
    SendResult::rejected(
        FailureReason::VendorRejected,
        format!("'{to}' is not a valid email address"),
    )
}

fn html_body(body: &str) -> String {
    if body.trim_start().starts_with('<') {
        body.to_string()
    } else {
        body.replace('\n', "<br>")
    }
}

pub struct SendGridAdapter {
    transport: Arc<dyn Transport>,
}

impl SendGridAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn rejection(response: &TransportResponse, from_email: &str) -> SendResult {
        let text = vendor_error_text(response);
        let unverified = response.status == 403
            || text.to_ascii_lowercase().contains("sender identity");
        if unverified {
            return SendResult::rejected(
                FailureReason::VendorRejected,
                format!(
                    "{text}. The sender identity {from_email} is not verified in SendGrid; \
                     verify it under Settings > Sender Authentication or use a verified address"
                ),
            );
        }
        SendResult::rejected(FailureReason::VendorRejected, text)
    }
}

#[async_trait]
impl ProviderAdapter for SendGridAdapter {
    fn kind(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::Sendgrid {
            api_key,
            from_email,
            from_name,
            reply_to,
        } = &provider.credentials
        else {
            return wrong_kind(provider, "sendgrid");
        };
        if !is_valid_email(&message.to) {
            return invalid_address(&message.to);
        }

        let mut payload = json!({
            "personalizations": [{
                "to": [{"email": message.to.trim()}],
                "custom_args": {"reference": message.reference}
            }],
            "from": {
                "email": from_email,
                "name": from_name.as_deref().unwrap_or(from_email.as_str())
            },
            "subject": message.subject.as_deref().unwrap_or(""),
            "content": [
                {"type": "text/plain", "value": message.body},
                {"type": "text/html", "value": html_body(&message.body)}
            ],
            "tracking_settings": {
                "click_tracking": {"enable": true},
                "open_tracking": {"enable": true}
            }
        });
        if let Some(reply_to) = reply_to {
            payload["reply_to"] = json!({"email": reply_to});
        }

        debug!(provider = %provider.name, to = %message.to, "Sending email via SendGrid");
        let request = TransportRequest {
            vendor: self.kind(),
            method: "POST",
            url: format!("{SENDGRID_API}/mail/send"),
            headers: vec![
                ("Authorization".to_string(), format!("Bearer {}", api_key.expose())),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: payload,
            idempotency_key: Some(message.reference.clone()),
        };

        match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => {
                SendResult::accepted(resp.header("x-message-id").map(str::to_string))
            }
            Ok(resp) => {
                warn!(provider = %provider.name, status = resp.status, "SendGrid rejected email");
                Self::rejection(&resp, from_email)
            }
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::Sendgrid { api_key, .. } = &provider.credentials else {
            return HealthStatus::Unhealthy;
        };
        if !provider.credentials.has_minimum_credentials() {
            return HealthStatus::Unhealthy;
        }
        let request = TransportRequest {
            vendor: self.kind(),
            method: "GET",
            url: format!("{SENDGRID_API}/scopes"),
            headers: vec![(
                "Authorization".to_string(),
                format!("Bearer {}", api_key.expose()),
            )],
            body: serde_json::Value::Null,
            idempotency_key: None,
        };
        health_from(self.transport.execute(request).await)
    }
}

/// AWS SES v2 `SendEmail`. Request signing (SigV4) belongs to the transport;
/// the adapter passes the key id and region it needs.
pub struct SesAdapter {
    transport: Arc<dyn Transport>,
}

impl SesAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn endpoint(region: &str) -> String {
        format!("https://email.{region}.amazonaws.com/v2/email")
    }
}

#[async_trait]
impl ProviderAdapter for SesAdapter {
    fn kind(&self) -> &'static str {
        "aws_ses"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::AwsSes {
            access_key_id,
            region,
            from_email,
            ..
        } = &provider.credentials
        else {
            return wrong_kind(provider, "aws_ses");
        };
        if !is_valid_email(&message.to) {
            return invalid_address(&message.to);
        }

        let payload = json!({
            "FromEmailAddress": from_email,
            "Destination": {"ToAddresses": [message.to.trim()]},
            "Content": {
                "Simple": {
                    "Subject": {"Data": message.subject.as_deref().unwrap_or("")},
                    "Body": {
                        "Text": {"Data": message.body},
                        "Html": {"Data": html_body(&message.body)}
                    }
                }
            },
            "EmailTags": [{"Name": "reference", "Value": message.reference.replace(':', "_")}]
        });

        let request = TransportRequest {
            vendor: self.kind(),
            method: "POST",
            url: format!("{}/outbound-emails", Self::endpoint(region)),
            headers: vec![
                ("X-Amz-Access-Key-Id".to_string(), access_key_id.expose().to_string()),
                ("X-Amz-Region".to_string(), region.clone()),
            ],
            body: payload,
            idempotency_key: None,
        };

        match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => SendResult::accepted(
                resp.body["MessageId"].as_str().map(str::to_string),
            ),
            Ok(resp) => {
                let text = vendor_error_text(&resp);
                let text = if text.contains("not verified") {
                    format!("{text}. Verify {from_email} in the SES console for {region}")
                } else {
                    text
                };
                SendResult::rejected(FailureReason::VendorRejected, text)
            }
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::AwsSes {
            access_key_id,
            region,
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
            url: format!("{}/account", Self::endpoint(region)),
            headers: vec![("X-Amz-Access-Key-Id".to_string(), access_key_id.expose().to_string())],
            body: serde_json::Value::Null,
            idempotency_key: None,
        };
        health_from(self.transport.execute(request).await)
    }
}

/// SMTP relay. The transport owns the SMTP session; the request body carries
/// the envelope and message.
pub struct SmtpAdapter {
    transport: Arc<dyn Transport>,
}

impl SmtpAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProviderAdapter for SmtpAdapter {
    fn kind(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, provider: &ProviderSettings, message: &OutboundMessage) -> SendResult {
        let ProviderCredentials::Smtp {
            host,
            port,
            username,
            password,
            use_tls,
            from_email,
        } = &provider.credentials
        else {
            return wrong_kind(provider, "smtp");
        };
        if !is_valid_email(&message.to) {
            return invalid_address(&message.to);
        }

        let payload = json!({
            "mail_from": from_email,
            "rcpt_to": [message.to.trim()],
            "subject": message.subject.as_deref().unwrap_or(""),
            "text": message.body,
            "html": html_body(&message.body),
            "headers": {"X-Campaign-Reference": message.reference},
            "auth": username.as_ref().map(|u| json!({
                "username": u,
                "password": password.as_ref().map(|p| p.expose()).unwrap_or("")
            })),
            "starttls": use_tls
        });

        let request = TransportRequest {
            vendor: self.kind(),
            method: "SEND",
            url: format!("smtp://{host}:{port}"),
            headers: Vec::new(),
            body: payload,
            idempotency_key: None,
        };

        match self.transport.execute(request).await {
            Ok(resp) if resp.is_success() => SendResult::accepted(
                resp.body["message_id"].as_str().map(str::to_string),
            ),
            Ok(resp) => SendResult::rejected(
                FailureReason::VendorRejected,
                format!("SMTP {}: {}", resp.status, resp.body["message"].as_str().unwrap_or("rejected")),
            ),
            Err(err) => SendResult::from_transport_error(&err),
        }
    }

    async fn health_check(&self, provider: &ProviderSettings) -> HealthStatus {
        let ProviderCredentials::Smtp { host, port, .. } = &provider.credentials else {
            return HealthStatus::Unhealthy;
        };
        if !provider.credentials.has_minimum_credentials() {
            return HealthStatus::Unhealthy;
        }
        let request = TransportRequest {
            vendor: self.kind(),
            method: "GET",
            url: format!("smtp://{host}:{port}"),
            headers: Vec::new(),
            body: serde_json::Value::Null,
            idempotency_key: None,
        };
        health_from(self.transport.execute(request).await)
    }
}
