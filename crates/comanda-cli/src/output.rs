//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use chrono::{DateTime, Local};
use serde_json::Value;

use comanda_core::Record;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print a single record, one field per line
    pub fn print_record(&self, record: &Record) {
        match self.format {
            OutputFormat::Human => {
                let width = record
                    .fields()
                    .keys()
                    .map(String::len)
                    .max()
                    .unwrap_or(0)
                    .max(2);
                println!("{:width$}  {}", "id", record.id(), width = width);
                for (key, value) in record.fields() {
                    println!("{:width$}  {}", key, display_value(value), width = width);
                }
            }
            OutputFormat::Json => {
                println!("{}", pretty(&record.to_value()));
            }
            OutputFormat::Quiet => {
                println!("{}", record.id());
            }
        }
    }

    /// Print the records of a collection
    pub fn print_records(&self, collection: &str, records: &[Record]) {
        match self.format {
            OutputFormat::Human => {
                if records.is_empty() {
                    println!("No records in {}.", collection);
                    return;
                }
                for record in records {
                    println!(
                        "{} | {}",
                        truncate(record.id(), 32),
                        truncate(&summary(record), 80)
                    );
                }
                println!("\n{} record(s)", records.len());
            }
            OutputFormat::Json => {
                let values: Vec<Value> = records.iter().map(Record::to_value).collect();
                println!("{}", pretty(&Value::Array(values)));
            }
            OutputFormat::Quiet => {
                for record in records {
                    println!("{}", record.id());
                }
            }
        }
    }

    /// Print one delivery of a watched collection
    pub fn print_delivery(&self, collection: &str, at: DateTime<Local>, records: &[Record]) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "── {} {} ({} record(s)) ──",
                    at.format("%H:%M:%S"),
                    collection,
                    records.len()
                );
                for record in records {
                    println!("{} | {}", truncate(record.id(), 32), truncate(&summary(record), 80));
                }
            }
            OutputFormat::Json => {
                // One JSON document per line so the stream can be piped
                let values: Vec<Value> = records.iter().map(Record::to_value).collect();
                println!(
                    "{}",
                    serde_json::json!({
                        "collection": collection,
                        "at": at.to_rfc3339(),
                        "records": values
                    })
                );
            }
            OutputFormat::Quiet => {
                println!("{}", records.len());
            }
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Render a field value without quoting plain strings
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One-line `key=value` summary of a record's fields
fn summary(record: &Record) -> String {
    record
        .fields()
        .iter()
        .map(|(key, value)| format!("{}={}", key, display_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncate a string to max characters, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comanda_core::models::fields_from_value;
    use serde_json::json;

    #[test]
    fn test_format_from_flags() {
        assert_eq!(OutputFormat::from_flags(false, false), OutputFormat::Human);
        assert_eq!(OutputFormat::from_flags(true, false), OutputFormat::Json);
        assert_eq!(OutputFormat::from_flags(false, true), OutputFormat::Quiet);
        // Quiet takes precedence
        assert_eq!(OutputFormat::from_flags(true, true), OutputFormat::Quiet);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("pão de queijo", 8), "pão d...");
    }

    #[test]
    fn test_summary() {
        let record = Record::from_fields(
            "c1",
            fields_from_value(json!({"code": "PROMO10", "discount": 10, "active": true})).unwrap(),
        );
        assert_eq!(summary(&record), "active=true code=PROMO10 discount=10");
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!("NOVO")), "NOVO");
        assert_eq!(display_value(&json!(12.5)), "12.5");
        assert_eq!(display_value(&json!(null)), "null");
    }
}
