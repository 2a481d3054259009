//! Output formatting for datasift-cli (text, json)

use chrono::Local;
use clap::ValueEnum;
use colored::Colorize;
use datasift_client::{ClientEvent, SubscribeOutcome};
use serde::Serialize;
use serde_json::{json, Value};
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, colored lines (default)
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

/// Context for output rendering
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            eprintln!("{}", msg);
        }
    }

    /// Print a warning message
    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    /// Print subscription results
    pub fn print_outcomes(&self, outcomes: &[SubscribeOutcome]) {
        let rows: Vec<OutcomeRow> = outcomes.iter().map(OutcomeRow::from).collect();
        match self.format {
            OutputFormat::Text => {
                if !self.quiet {
                    eprintln!("{}", Table::new(&rows));
                }
            }
            OutputFormat::Json => {
                for row in &rows {
                    println!(
                        "{}",
                        json!({"event": "subscription", "hash": row.hash, "status": row.status, "detail": row.detail})
                    );
                }
            }
        }
    }

    /// Print one client event; debug events are left to the log
    pub fn print_event(&self, event: &ClientEvent) {
        if matches!(event, ClientEvent::Debug(_)) {
            return;
        }
        match self.format {
            OutputFormat::Text => println!("{}", format_text(event)),
            OutputFormat::Json => println!("{}", event_json(event)),
        }
    }
}

/// Subscription outcome display
#[derive(Debug, Tabled, Serialize)]
pub struct OutcomeRow {
    #[tabled(rename = "Hash")]
    pub hash: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "Detail")]
    pub detail: String,
}

impl From<&SubscribeOutcome> for OutcomeRow {
    fn from(outcome: &SubscribeOutcome) -> Self {
        match &outcome.result {
            Ok(subscription) => Self {
                hash: outcome.hash.clone(),
                status: "subscribed".to_string(),
                detail: match &subscription.metadata {
                    Value::Object(map) if map.is_empty() => String::new(),
                    other => other.to_string(),
                },
            },
            Err(e) => Self {
                hash: outcome.hash.clone(),
                status: "failed".to_string(),
                detail: e.to_string(),
            },
        }
    }
}

fn format_text(event: &ClientEvent) -> String {
    let time = Local::now().format("%H:%M:%S").to_string().dimmed();
    let line = match event {
        ClientEvent::Connect => "Connected".cyan().to_string(),
        ClientEvent::Disconnect => "Disconnected".cyan().to_string(),
        ClientEvent::Error(e) => format!("{} {}", "Error:".red().bold(), e),
        ClientEvent::Success { message, .. } => format!("{} {}", "Success:".green(), message),
        ClientEvent::Warning { message, .. } => format!("{} {}", "Warning:".yellow(), message),
        ClientEvent::Interaction(record) => format!(
            "{} {}",
            "Received data:".bold(),
            record.get("data").unwrap_or(record)
        ),
        ClientEvent::Delete(record) => format!("{} {}", "Delete:".magenta(), record),
        ClientEvent::Tick(record) => format!("{} {}", "Tick:".dimmed(), record),
        ClientEvent::UnknownEvent(record) => format!("{} {}", "Unknown:".dimmed(), record),
        ClientEvent::Debug(message) => message.dimmed().to_string(),
    };
    format!("[{time}] {line}")
}

fn event_json(event: &ClientEvent) -> Value {
    let mut object = json!({"event": event.name()});
    match event {
        ClientEvent::Error(e) => object["message"] = json!(e.to_string()),
        ClientEvent::Success { message, .. } | ClientEvent::Warning { message, .. } => {
            object["message"] = json!(message);
        }
        ClientEvent::Debug(message) => object["message"] = json!(message),
        _ => {}
    }
    if let Some(record) = event.record() {
        object["record"] = record.clone();
    }
    object
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasift_client::{ClientError, StreamState, Subscription};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_event_json() {
        let event = ClientEvent::Interaction(json!({"data": {"interaction": {"id": "1"}}}));
        assert_eq!(
            event_json(&event),
            json!({"event": "interaction", "record": {"data": {"interaction": {"id": "1"}}}})
        );

        let warning = ClientEvent::Warning {
            message: "slow".to_string(),
            raw: None,
        };
        assert_eq!(
            event_json(&warning),
            json!({"event": "warning", "message": "slow"})
        );
    }

    #[test]
    fn test_outcome_rows() {
        let ok = SubscribeOutcome {
            hash: "a".repeat(32),
            result: Ok(Subscription {
                hash: "a".repeat(32),
                state: StreamState::Subscribed,
                metadata: json!({}),
            }),
        };
        let failed = SubscribeOutcome {
            hash: "xyz".to_string(),
            result: Err(ClientError::InvalidIdentifier("xyz".to_string())),
        };

        let row = OutcomeRow::from(&ok);
        assert_eq!(row.status, "subscribed");
        assert_eq!(row.detail, "");

        let row = OutcomeRow::from(&failed);
        assert_eq!(row.status, "failed");
        assert_eq!(row.detail, "Invalid stream hash: \"xyz\"");
    }

    #[test]
    fn test_text_has_no_color_codes_when_disabled() {
        colored::control::set_override(false);
        let line = format_text(&ClientEvent::Warning {
            message: "careful".to_string(),
            raw: None,
        });
        assert!(line.ends_with("Warning: careful"));
    }
}
