//! Vendor webhook payload parsing.
//!
//! Each channel accepts the payload shapes of the vendors that serve it and
//! normalizes them into `(external_id, DeliveryStatus)` pairs. Events whose
//! names are known but carry no ledger meaning (`processed`, `queued`, ...)
//! are counted as ignored; anything else that parses but cannot be mapped is
//! counted as unrecognized. Only a body that is not JSON or form data at all
//! is an error.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use campaign_core::types::{Channel, DeliveryStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub external_id: String,
    pub status: DeliveryStatus,
    pub detail: Option<String>,
    /// Vendor event name as received.
    pub vendor_event: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedBatch {
    pub events: Vec<WebhookEvent>,
    pub ignored: usize,
    pub unrecognized: usize,
}

#[derive(Error, Debug)]
pub enum WebhookParseError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not valid UTF-8")]
    Encoding,
}

enum Mapping {
    Status(DeliveryStatus),
    Ignored,
    Unknown,
}

impl ParsedBatch {
    fn push(&mut self, external_id: Option<String>, event: &str, mapping: Mapping, detail: Option<String>) {
        match (external_id, mapping) {
            (Some(external_id), Mapping::Status(status)) if !external_id.is_empty() => {
                self.events.push(WebhookEvent {
                    external_id,
                    status,
                    detail,
                    vendor_event: event.to_string(),
                })
            }
            (_, Mapping::Ignored) => self.ignored += 1,
            _ => self.unrecognized += 1,
        }
    }
}

/// Parse a webhook body posted to `/webhook/{channel}`.
pub fn parse_webhook(
    channel: Channel,
    body: &[u8],
    content_type: Option<&str>,
) -> Result<ParsedBatch, WebhookParseError> {
    match channel {
        Channel::Email => parse_email(serde_json::from_slice(body)?),
        Channel::Sms => Ok(parse_twilio(&fields(body, content_type)?)),
        Channel::Chat => {
            if is_json(body, content_type) {
                let value: Value = serde_json::from_slice(body)?;
                if value.get("entry").is_some() {
                    return Ok(parse_meta(&value));
                }
                Ok(parse_twilio(&object_fields(&value)))
            } else {
                Ok(parse_twilio(&form_fields(body)?))
            }
        }
    }
}

fn is_json(body: &[u8], content_type: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        if ct.contains("json") {
            return true;
        }
        if ct.contains("x-www-form-urlencoded") {
            return false;
        }
    }
    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

fn fields(body: &[u8], content_type: Option<&str>) -> Result<HashMap<String, String>, WebhookParseError> {
    if is_json(body, content_type) {
        let value: Value = serde_json::from_slice(body)?;
        Ok(object_fields(&value))
    } else {
        form_fields(body)
    }
}

fn form_fields(body: &[u8]) -> Result<HashMap<String, String>, WebhookParseError> {
    std::str::from_utf8(body).map_err(|_| WebhookParseError::Encoding)?;
    Ok(url::form_urlencoded::parse(body).into_owned().collect())
}

fn object_fields(value: &Value) -> HashMap<String, String> {
    let Some(map) = value.as_object() else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), text))
        })
        .collect()
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

// ─── Email ──────────────────────────────────────────────────────────────────

fn parse_email(value: Value) -> Result<ParsedBatch, WebhookParseError> {
    let mut batch = ParsedBatch::default();
    match value {
        Value::Array(items) => {
            for item in &items {
                let event = str_field(item, "event").unwrap_or_default();
                // SendGrid appends a filter suffix after the first dot.
                let id = str_field(item, "sg_message_id")
                    .map(|id| id.split('.').next().unwrap_or_default().to_string())
                    .or_else(|| str_field(item, "message_id"));
                let detail = str_field(item, "reason").or_else(|| str_field(item, "response"));
                batch.push(id, &event, sendgrid_mapping(&event), detail);
            }
        }
        Value::Object(_) => {
            let event = str_field(&value, "event").unwrap_or_default();
            let id = str_field(&value, "message_id");
            let detail = str_field(&value, "reason");
            batch.push(id, &event, relay_mapping(&event), detail);
        }
        _ => batch.unrecognized += 1,
    }
    Ok(batch)
}

fn sendgrid_mapping(event: &str) -> Mapping {
    match event {
        "delivered" => Mapping::Status(DeliveryStatus::Delivered),
        "open" => Mapping::Status(DeliveryStatus::Opened),
        "click" => Mapping::Status(DeliveryStatus::Clicked),
        "bounce" | "dropped" | "spamreport" => Mapping::Status(DeliveryStatus::Failed),
        "processed" | "deferred" | "unsubscribe" | "group_unsubscribe" | "group_resubscribe" => {
            Mapping::Ignored
        }
        _ => Mapping::Unknown,
    }
}

fn relay_mapping(event: &str) -> Mapping {
    match event.to_ascii_lowercase().as_str() {
        "delivered" | "delivery" => Mapping::Status(DeliveryStatus::Delivered),
        "open" | "opened" => Mapping::Status(DeliveryStatus::Opened),
        "click" | "clicked" => Mapping::Status(DeliveryStatus::Clicked),
        "bounce" | "bounced" | "failed" | "complaint" => Mapping::Status(DeliveryStatus::Failed),
        "sent" | "send" | "queued" => Mapping::Ignored,
        _ => Mapping::Unknown,
    }
}

// ─── Twilio (SMS and WhatsApp) ──────────────────────────────────────────────

fn parse_twilio(fields: &HashMap<String, String>) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    let id = fields
        .get("MessageSid")
        .or_else(|| fields.get("SmsSid"))
        .cloned();
    let event = fields
        .get("MessageStatus")
        .or_else(|| fields.get("SmsStatus"))
        .cloned()
        .unwrap_or_default();
    let detail = fields
        .get("ErrorCode")
        .filter(|c| !c.is_empty())
        .map(|code| match fields.get("ErrorMessage") {
            Some(msg) => format!("twilio error {code}: {msg}"),
            None => format!("twilio error {code}"),
        });
    batch.push(id, &event, twilio_mapping(&event), detail);
    batch
}

fn twilio_mapping(event: &str) -> Mapping {
    match event {
        "delivered" => Mapping::Status(DeliveryStatus::Delivered),
        "read" => Mapping::Status(DeliveryStatus::Opened),
        "failed" | "undelivered" => Mapping::Status(DeliveryStatus::Failed),
        "accepted" | "scheduled" | "queued" | "sending" | "sent" | "receiving" | "received" => {
            Mapping::Ignored
        }
        _ => Mapping::Unknown,
    }
}

// ─── Meta WhatsApp Cloud API ────────────────────────────────────────────────

fn parse_meta(value: &Value) -> ParsedBatch {
    let mut batch = ParsedBatch::default();
    let values = value
        .get("entry")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("changes").and_then(Value::as_array))
        .flatten()
        .filter_map(|change| change.get("value"));

    for change in values {
        for status in change
            .get("statuses")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let event = str_field(status, "status").unwrap_or_default();
            let detail = status
                .get("errors")
                .and_then(Value::as_array)
                .and_then(|errors| errors.first())
                .and_then(|err| str_field(err, "title").or_else(|| str_field(err, "message")));
            batch.push(str_field(status, "id"), &event, meta_mapping(&event), detail);
        }

        for message in change
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            // Only replies quoting one of our messages carry a context id.
            match message.get("context").and_then(|ctx| str_field(ctx, "id")) {
                Some(id) => batch.push(
                    Some(id),
                    "reply",
                    Mapping::Status(DeliveryStatus::Replied),
                    None,
                ),
                None => batch.ignored += 1,
            }
        }
    }
    batch
}

fn meta_mapping(event: &str) -> Mapping {
    match event {
        "delivered" => Mapping::Status(DeliveryStatus::Delivered),
        "read" => Mapping::Status(DeliveryStatus::Opened),
        "failed" => Mapping::Status(DeliveryStatus::Failed),
        "sent" => Mapping::Ignored,
        _ => Mapping::Unknown,
    }
}
