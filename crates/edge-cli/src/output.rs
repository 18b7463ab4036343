//! Output formatting for edge-cli (table, json, csv)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
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
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Whether progress bars may draw on the terminal
    pub fn interactive(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Table
    }

    /// Print data in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
            OutputFormat::Csv => {
                for line in csv_lines(data) {
                    println!("{}", line);
                }
            }
        }
    }

    /// Print key-value pairs
    pub fn print_kv(&self, pairs: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => {
                for (key, value) in pairs {
                    println!("{}: {}", key.bold(), value);
                }
            }
            OutputFormat::Json => {
                let map: serde_json::Map<String, serde_json::Value> = pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&map).unwrap_or_else(|_| "{}".to_string())
                );
            }
            OutputFormat::Csv => {
                let keys: Vec<&str> = pairs.iter().map(|(k, _)| *k).collect();
                println!("{}", keys.join(","));
                let values: Vec<String> = pairs.iter().map(|(_, v)| escape_csv(v)).collect();
                println!("{}", values.join(","));
            }
        }
    }
}

/// Render rows as CSV, header first, columns in field order of the first row
fn csv_lines<T: Serialize>(data: &[T]) -> Vec<String> {
    let Some(first) = data.first() else {
        return Vec::new();
    };
    let serde_json::Value::Object(map) = serde_json::to_value(first).unwrap_or_default() else {
        return Vec::new();
    };
    let headers: Vec<String> = map.keys().cloned().collect();

    let mut lines = vec![headers.join(",")];
    for item in data {
        if let Ok(serde_json::Value::Object(row)) = serde_json::to_value(item) {
            let values: Vec<String> = headers
                .iter()
                .map(|h| {
                    row.get(h)
                        .map(|v| match v {
                            serde_json::Value::String(s) => escape_csv(s),
                            other => escape_csv(&other.to_string()),
                        })
                        .unwrap_or_default()
                })
                .collect();
            lines.push(values.join(","));
        }
    }
    lines
}

/// Escape a value for CSV output
fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

// =============================================================================
// Display types for the commands
// =============================================================================

/// One VIN query attempt for scan-vin
#[derive(Debug, Tabled, Serialize)]
pub struct VinRow {
    #[tabled(rename = "Query")]
    pub query: String,
    #[tabled(rename = "Protocol")]
    pub protocol: String,
    #[tabled(rename = "VIN")]
    pub vin: String,
}

/// One raw OBD response line for can-dump-v2
#[derive(Debug, Tabled, Serialize)]
pub struct RawLineRow {
    #[tabled(rename = "Cycle")]
    pub cycle: u32,
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Header")]
    pub header: String,
    #[tabled(rename = "PID")]
    pub pid: String,
    #[tabled(rename = "Line")]
    pub line: String,
}

/// One decoded sample for dbc-scan
#[derive(Debug, Tabled, Serialize)]
pub struct SampleRow {
    #[tabled(rename = "Signal")]
    pub name: String,
    #[tabled(rename = "Timestamp")]
    pub timestamp: i64,
    #[tabled(rename = "Value")]
    pub value: String,
}
