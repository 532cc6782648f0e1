// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//!
//! Output rendering for admin command results.
//!
//! Every command produces a JSON value; this module prints it either as
//! pretty JSON or as indented `key: value` text for terminals.

use std::fmt;
use std::fmt::Write as _;

use serde_json::Value;

/// Available output formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown format '{other}'. Valid formats: text, json")),
        }
    }
}

pub fn render(value: &Value, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        OutputFormat::Text => {
            let mut out = String::new();
            render_text(&mut out, value, 0);
            out.trim_end().to_string()
        }
    }
}

fn render_text(out: &mut String, value: &Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        Value::Object(map) if map.is_empty() => {
            let _ = writeln!(out, "{indent}(empty)");
        }
        Value::Object(map) => {
            for (key, item) in map {
                if is_scalar(item) {
                    let _ = writeln!(out, "{indent}{key}: {}", scalar(item));
                } else {
                    let _ = writeln!(out, "{indent}{key}:");
                    render_text(out, item, depth + 1);
                }
            }
        }
        Value::Array(items) if items.is_empty() => {
            let _ = writeln!(out, "{indent}(none)");
        }
        Value::Array(items) => {
            for item in items {
                if is_scalar(item) {
                    let _ = writeln!(out, "{indent}- {}", scalar(item));
                } else {
                    let _ = writeln!(out, "{indent}-");
                    render_text(out, item, depth + 1);
                }
            }
        }
        other => {
            let _ = writeln!(out, "{indent}{}", scalar(other));
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
