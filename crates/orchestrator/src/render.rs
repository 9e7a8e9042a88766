//! Placeholder substitution for step content.

use std::collections::HashMap;

use campaign_core::types::{ContentTemplate, Recipient};

/// Subject and body of a template rendered for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: Option<String>,
    pub body: String,
}

/// Values available to templates. Recipient attributes come first so the
/// built-in keys win on collision.
pub fn template_values(recipient: &Recipient) -> HashMap<String, String> {
    let mut values = recipient.attributes.clone();
    let first_name = recipient
        .name
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();
    values.insert("name".to_string(), recipient.name.clone());
    values.insert("first_name".to_string(), first_name);
    values.insert("email".to_string(), recipient.email.clone().unwrap_or_default());
    values.insert("phone".to_string(), recipient.phone.clone().unwrap_or_default());
    values
}

pub fn render(template: &ContentTemplate, recipient: &Recipient) -> RenderedContent {
    let values = template_values(recipient);
    RenderedContent {
        subject: template.subject.as_deref().map(|s| substitute(s, &values)),
        body: substitute(&template.body, &values),
    }
}

/// Replace every `{{key}}` (inner whitespace allowed). Unknown keys render
/// as empty; an unterminated `{{` is kept verbatim.
pub fn substitute(text: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = values.get(key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_recipient() -> Recipient {
        let mut attributes = HashMap::new();
        attributes.insert("plan".to_string(), "Pro".to_string());
        attributes.insert("name".to_string(), "shadowed".to_string());
        Recipient {
            id: Uuid::new_v4(),
            name: "Ada Lovelace".to_string(),
            email: Some("ada@example.com".to_string()),
            phone: None,
            attributes,
            deleted_at: None,
        }
    }

    #[test]
    fn test_builtin_and_attribute_placeholders() {
        let template = ContentTemplate {
            name: "welcome".to_string(),
            subject: Some("Welcome, {{first_name}}".to_string()),
            body: "Hi {{ name }}, your {{plan}} plan is ready at {{email}}.".to_string(),
        };
        let rendered = render(&template, &make_recipient());
        assert_eq!(rendered.subject.as_deref(), Some("Welcome, Ada"));
        assert_eq!(
            rendered.body,
            "Hi Ada Lovelace, your Pro plan is ready at ada@example.com."
        );
    }

    #[test]
    fn test_unknown_placeholder_renders_empty() {
        let values = template_values(&make_recipient());
        assert_eq!(substitute("a{{missing}}b{{phone}}c", &values), "abc");
        assert_eq!(substitute("open {{name", &values), "open {{name");
    }
}
