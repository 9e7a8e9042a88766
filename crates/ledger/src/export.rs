//! Ledger export as CSV or JSON.

use std::str::FromStr;

use serde_json::Value;

use campaign_core::error::{CampaignError, CampaignResult};
use campaign_core::types::LedgerEntry;

const COLUMNS: [&str; 13] = [
    "task_key",
    "campaign_id",
    "step_id",
    "recipient_id",
    "channel",
    "status",
    "provider_id",
    "external_id",
    "error_code",
    "error",
    "attempt_started_at",
    "sent_at",
    "updated_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Json => "application/json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = CampaignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(CampaignError::Validation(format!(
                "unsupported export format '{other}' (expected csv or json)"
            ))),
        }
    }
}

/// Render rows in `format`. Returns the content type alongside the body.
pub fn export_entries(
    entries: &[LedgerEntry],
    format: ExportFormat,
) -> CampaignResult<(&'static str, String)> {
    let body = match format {
        ExportFormat::Json => serde_json::to_string(entries)?,
        ExportFormat::Csv => {
            let mut csv = COLUMNS.join(",");
            csv.push('\n');
            for entry in entries {
                let record = serde_json::to_value(entry)?;
                let cells: Vec<String> = COLUMNS
                    .iter()
                    .map(|col| match record.get(*col) {
                        Some(Value::String(s)) => format!("\"{}\"", s.replace('"', "\"\"")),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    })
                    .collect();
                csv.push_str(&cells.join(","));
                csv.push('\n');
            }
            csv
        }
    };
    Ok((format.content_type(), body))
}
