//! Provider configuration contract.
//!
//! Each configured vendor backend is one tagged variant carrying exactly the
//! credentials that vendor needs; validation happens once at load time.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CampaignError, CampaignResult};
use crate::types::Channel;

/// Credential string that never shows up in `Debug` output or logs.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

/// Vendor-specific credentials, one variant per provider type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderCredentials {
    Sendgrid {
        api_key: Secret,
        from_email: String,
        #[serde(default)]
        from_name: Option<String>,
        #[serde(default)]
        reply_to: Option<String>,
    },
    AwsSes {
        access_key_id: Secret,
        secret_access_key: Secret,
        region: String,
        from_email: String,
    },
    Smtp {
        host: String,
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<Secret>,
        #[serde(default)]
        use_tls: bool,
        from_email: String,
    },
    TwilioSms {
        account_sid: String,
        auth_token: Secret,
        from_number: String,
        #[serde(default)]
        status_callback_url: Option<String>,
    },
    Msg91 {
        auth_key: Secret,
        sender_id: String,
        #[serde(default)]
        template_id: Option<String>,
    },
    MetaWhatsapp {
        access_token: Secret,
        phone_number_id: String,
        #[serde(default = "default_graph_api_version")]
        api_version: String,
    },
    TwilioWhatsapp {
        account_sid: String,
        auth_token: Secret,
        from_number: String,
    },
}

fn default_graph_api_version() -> String {
    "v18.0".to_string()
}

impl ProviderCredentials {
    pub fn channel(&self) -> Channel {
        match self {
            ProviderCredentials::Sendgrid { .. }
            | ProviderCredentials::AwsSes { .. }
            | ProviderCredentials::Smtp { .. } => Channel::Email,
            ProviderCredentials::TwilioSms { .. } | ProviderCredentials::Msg91 { .. } => {
                Channel::Sms
            }
            ProviderCredentials::MetaWhatsapp { .. }
            | ProviderCredentials::TwilioWhatsapp { .. } => Channel::Chat,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderCredentials::Sendgrid { .. } => "sendgrid",
            ProviderCredentials::AwsSes { .. } => "aws_ses",
            ProviderCredentials::Smtp { .. } => "smtp",
            ProviderCredentials::TwilioSms { .. } => "twilio_sms",
            ProviderCredentials::Msg91 { .. } => "msg91",
            ProviderCredentials::MetaWhatsapp { .. } => "meta_whatsapp",
            ProviderCredentials::TwilioWhatsapp { .. } => "twilio_whatsapp",
        }
    }

    /// Names of required credential fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let mut check = |blank: bool, name: &'static str| {
            if blank {
                missing.push(name);
            }
        };
        match self {
            ProviderCredentials::Sendgrid {
                api_key, from_email, ..
            } => {
                check(api_key.is_blank(), "api_key");
                check(from_email.trim().is_empty(), "from_email");
            }
            ProviderCredentials::AwsSes {
                access_key_id,
                secret_access_key,
                region,
                from_email,
            } => {
                check(access_key_id.is_blank(), "access_key_id");
                check(secret_access_key.is_blank(), "secret_access_key");
                check(region.trim().is_empty(), "region");
                check(from_email.trim().is_empty(), "from_email");
            }
            ProviderCredentials::Smtp {
                host,
                port,
                from_email,
                ..
            } => {
                check(host.trim().is_empty(), "host");
                check(*port == 0, "port");
                check(from_email.trim().is_empty(), "from_email");
            }
            ProviderCredentials::TwilioSms {
                account_sid,
                auth_token,
                from_number,
                ..
            }
            | ProviderCredentials::TwilioWhatsapp {
                account_sid,
                auth_token,
                from_number,
            } => {
                check(account_sid.trim().is_empty(), "account_sid");
                check(auth_token.is_blank(), "auth_token");
                check(from_number.trim().is_empty(), "from_number");
            }
            ProviderCredentials::Msg91 {
                auth_key, sender_id, ..
            } => {
                check(auth_key.is_blank(), "auth_key");
                check(sender_id.trim().is_empty(), "sender_id");
            }
            ProviderCredentials::MetaWhatsapp {
                access_token,
                phone_number_id,
                ..
            } => {
                check(access_token.is_blank(), "access_token");
                check(phone_number_id.trim().is_empty(), "phone_number_id");
            }
        }
        missing
    }

    pub fn has_minimum_credentials(&self) -> bool {
        self.missing_fields().is_empty()
    }
}

/// One configured provider backend as read from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub credentials: ProviderCredentials,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u64,
    /// Lower rank is tried first.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_daily_limit() -> u64 {
    1000
}
fn default_monthly_limit() -> u64 {
    30_000
}
fn default_priority() -> u8 {
    1
}
fn default_active() -> bool {
    true
}

impl ProviderSettings {
    pub fn channel(&self) -> Channel {
        self.credentials.channel()
    }

    pub fn validate(&self) -> CampaignResult<()> {
        if self.name.trim().is_empty() {
            return Err(CampaignError::Config(format!(
                "provider {} has an empty name",
                self.id
            )));
        }
        if self.daily_limit == 0 || self.monthly_limit == 0 {
            return Err(CampaignError::Config(format!(
                "provider '{}' must have non-zero daily and monthly limits",
                self.name
            )));
        }
        if self.daily_limit > self.monthly_limit {
            return Err(CampaignError::Config(format!(
                "provider '{}' daily limit exceeds monthly limit",
                self.name
            )));
        }
        let missing = self.credentials.missing_fields();
        if self.is_active && !missing.is_empty() {
            return Err(CampaignError::Config(format!(
                "provider '{}' ({}) is missing credentials: {}",
                self.name,
                self.credentials.kind(),
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

/// Validates a full provider list: each entry, plus at most one default per
/// channel and unique ids.
pub fn validate_providers(providers: &[ProviderSettings]) -> CampaignResult<()> {
    let mut seen = std::collections::HashSet::new();
    for provider in providers {
        provider.validate()?;
        if !seen.insert(provider.id) {
            return Err(CampaignError::Config(format!(
                "duplicate provider id {}",
                provider.id
            )));
        }
    }
    for channel in Channel::ALL {
        let defaults = providers
            .iter()
            .filter(|p| p.channel() == channel && p.is_default)
            .count();
        if defaults > 1 {
            return Err(CampaignError::Config(format!(
                "{defaults} default providers configured for channel {channel}; at most one allowed"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sendgrid(name: &str, is_default: bool) -> ProviderSettings {
        ProviderSettings {
            id: Uuid::new_v4(),
            name: name.to_string(),
            credentials: ProviderCredentials::Sendgrid {
                api_key: Secret::new("SG.key"),
                from_email: "offers@example.com".to_string(),
                from_name: None,
                reply_to: None,
            },
            daily_limit: 100,
            monthly_limit: 1000,
            priority: 1,
            is_default,
            is_active: true,
        }
    }

    #[test]
    fn test_secret_is_redacted_in_debug() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_tagged_provider_deserializes_from_json() {
        let json = serde_json::json!({
            "name": "primary-sms",
            "kind": "twilio_sms",
            "account_sid": "AC123",
            "auth_token": "tok",
            "from_number": "+15550000000",
            "daily_limit": 50,
            "monthly_limit": 500
        });
        let settings: ProviderSettings = serde_json::from_value(json).unwrap();
        assert_eq!(settings.channel(), Channel::Sms);
        assert_eq!(settings.credentials.kind(), "twilio_sms");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_missing_credentials_rejected_at_load() {
        let mut settings = sendgrid("broken", false);
        settings.credentials = ProviderCredentials::Sendgrid {
            api_key: Secret::new(""),
            from_email: "offers@example.com".to_string(),
            from_name: None,
            reply_to: None,
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_two_defaults_for_one_channel_rejected() {
        let providers = vec![sendgrid("a", true), sendgrid("b", true)];
        assert!(validate_providers(&providers).is_err());
        let providers = vec![sendgrid("a", true), sendgrid("b", false)];
        assert!(validate_providers(&providers).is_ok());
    }
}
