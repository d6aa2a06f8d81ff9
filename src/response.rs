//! Stable JSON response envelope and output formatting for the CLI.

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub command: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Envelope {
    pub fn ok(command: &str, data: Value, duration_ms: u128) -> Self {
        Self {
            success: true,
            command: command.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            data: Some(data),
            error: None,
            metadata: Some(json!({
                "duration_ms": duration_ms as u64,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        }
    }

    pub fn err(command: &str, err: &Error, duration_ms: u128) -> Self {
        Self {
            success: false,
            command: command.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: first_line(&err.to_string()),
                details: suggestion_for(err).map(|s| json!({ "suggestion": s })),
            }),
            metadata: Some(json!({
                "duration_ms": duration_ms as u64,
                "version": env!("CARGO_PKG_VERSION"),
            })),
        }
    }

    pub fn print(&self, mode: OutputMode) {
        match mode {
            OutputMode::Json => {
                println!("{}", serde_json::to_string_pretty(self).expect("envelope serializes"));
            }
            OutputMode::Text => {
                if self.success {
                    if let Some(data) = &self.data {
                        print_human(data, 0);
                    }
                } else if let Some(error) = &self.error {
                    eprintln!("error [{}]: {}", error.code, error.message);
                    if let Some(suggestion) =
                        error.details.as_ref().and_then(|d| d.get("suggestion"))
                    {
                        eprintln!("  try: {}", suggestion.as_str().unwrap_or_default());
                    }
                }
            }
        }
    }
}

/// The human message is the first line of the root cause.
fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().to_string()
}

/// A suggested next action for common failures.
fn suggestion_for(err: &Error) -> Option<&'static str> {
    match err {
        Error::ProviderUnavailable(_) => Some("exitbook providers list"),
        Error::Validation(_) => Some("exitbook prices view --missing-only"),
        Error::Auth(_) => Some("check the provider's API key environment variable"),
        _ => None,
    }
}

fn print_human(value: &Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                match val {
                    Value::Object(_) | Value::Array(_) => {
                        println!("{pad}{key}:");
                        print_human(val, indent + 1);
                    }
                    _ => println!("{pad}{key}: {}", scalar(val)),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(_) | Value::Array(_) => {
                        println!("{pad}-");
                        print_human(item, indent + 1);
                    }
                    _ => println!("{pad}- {}", scalar(item)),
                }
            }
        }
        other => println!("{pad}{}", scalar(other)),
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_code_and_first_line() {
        let err = Error::Validation("bad row\nextra context".to_string());
        let envelope = Envelope::err("import", &err, 12);
        assert!(!envelope.success);
        let body = envelope.error.as_ref().unwrap();
        assert_eq!(body.code, "VALIDATION");
        assert_eq!(body.message, "validation: bad row");
    }

    #[test]
    fn success_envelope_has_metadata() {
        let envelope = Envelope::ok("links view", json!({"count": 3}), 5);
        assert!(envelope.success);
        let meta = envelope.metadata.unwrap();
        assert!(meta.get("version").is_some());
        assert_eq!(meta["duration_ms"], 5);
    }
}
