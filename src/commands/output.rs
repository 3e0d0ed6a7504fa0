//! Rendering of daemon responses as JSON or an indented key/value listing.

use anyhow::Result;
use colored::Colorize;
use serde_json::Value;

use crate::domain::node::{AgentStatus, ConnectionStatus};

pub fn print_output<T: serde::Serialize>(format: &str, data: &T) -> Result<()> {
    match format {
        "json" => {
            let json = serde_json::to_string_pretty(data)?;
            println!("{}", json);
        }
        _ => {
            let value = serde_json::to_value(data)?;
            print_value(&value, 0);
        }
    }
    Ok(())
}

fn print_value(value: &Value, indent: usize) {
    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                match val {
                    Value::Object(_) => {
                        println!("{}{}:", pad, key.bold());
                        print_value(val, indent + 1);
                    }
                    Value::Array(arr) if arr.is_empty() => {
                        println!("{}{}: []", pad, key.bold());
                    }
                    Value::Array(arr) if arr.iter().all(|v| !v.is_object() && !v.is_array()) => {
                        let items: Vec<String> = arr.iter().map(format_scalar).collect();
                        println!("{}{}: {}", pad, key.bold(), items.join(", "));
                    }
                    Value::Array(_) => {
                        println!("{}{}:", pad, key.bold());
                        print_value(val, indent + 1);
                    }
                    _ => println!("{}{}: {}", pad, key.bold(), format_scalar(val)),
                }
            }
        }
        Value::Array(arr) => {
            for (i, item) in arr.iter().enumerate() {
                if item.is_object() {
                    println!("{}[{}]:", pad, i);
                    print_value(item, indent + 1);
                } else {
                    println!("{}- {}", pad, format_scalar(item));
                }
            }
        }
        _ => println!("{}{}", pad, format_scalar(value)),
    }
}

fn format_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

pub fn connection_badge(status: ConnectionStatus) -> colored::ColoredString {
    match status {
        ConnectionStatus::Connected => "connected".green(),
        ConnectionStatus::Disconnected => "disconnected".red(),
    }
}

pub fn agent_badge(status: AgentStatus) -> colored::ColoredString {
    match status {
        AgentStatus::Success => "success".green(),
        AgentStatus::Failed => "failed".red().bold(),
        AgentStatus::Installing => "installing".yellow(),
        AgentStatus::Configuring => "configuring".yellow(),
        AgentStatus::Finalizing => "finalizing".yellow(),
        AgentStatus::Unspecified => "-".dimmed(),
    }
}
