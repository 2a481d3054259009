//! Record classification
//!
//! Every decoded record maps to exactly one kind. Status messages win over
//! payload shape, deletions win over interactions.

use serde_json::Value;

use crate::subscriptions::is_valid_hash;

/// Failure text the server sends after a stop command
pub const STOP_ACKNOWLEDGED: &str = "A stop message was received. You will now be disconnected";

/// Kind of a decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    Failure { message: String },
    Success { message: String },
    Warning { message: String },
    Delete,
    Tick,
    Interaction,
    Unknown,
}

/// Classify a record by priority:
/// failure, success/warning, deletion, tick, interaction, anything else.
pub fn classify(record: &Value) -> RecordKind {
    match record.get("status").and_then(Value::as_str) {
        Some("failure") => {
            return RecordKind::Failure {
                message: message_of(record),
            }
        }
        Some("success") => {
            return RecordKind::Success {
                message: message_of(record),
            }
        }
        Some("warning") => {
            return RecordKind::Warning {
                message: message_of(record),
            }
        }
        _ => {}
    }

    let data = record.get("data");
    if data
        .and_then(|d| d.get("deleted"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        return RecordKind::Delete;
    }
    if record.get("tick").is_some() {
        return RecordKind::Tick;
    }
    if data.and_then(|d| d.get("interaction")).is_some() {
        return RecordKind::Interaction;
    }
    RecordKind::Unknown
}

fn message_of(record: &Value) -> String {
    match record.get("message") {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Stream hash named by a rejection warning
///
/// Understands "The hash <hash> ..." and any message mentioning "invalid"
/// that contains a well-formed hash.
pub fn rejected_hash(message: &str) -> Option<&str> {
    if message.starts_with("The hash") {
        return message
            .split_whitespace()
            .nth(2)
            .map(trim_token)
            .filter(|token| !token.is_empty());
    }

    if message.to_ascii_lowercase().contains("invalid") {
        return message
            .split_whitespace()
            .map(trim_token)
            .find(|token| is_valid_hash(token));
    }

    None
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| !c.is_ascii_alphanumeric())
}
