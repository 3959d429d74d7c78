//! Instance subcommands: run, resume, status, logs, send-event.

use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use stepwise_core::workflow::InstanceHandle;
use stepwise_types::instance::{InstanceStatus, InstanceStatusDetails, LogEntry};

use crate::demos;
use crate::state::AppState;

/// Width after which log metadata is elided in the table view.
const DETAILS_WIDTH: usize = 60;

// ---------------------------------------------------------------------------
// Run / resume / send-event
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    id: Option<String>,
    params: Option<&str>,
    timeout: u64,
    json: bool,
) -> Result<()> {
    let binding = state.binding(workflow)?;
    let params = parse_json(params, "params")?;

    let handle = binding
        .create(id, params)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create instance: {e}"))?;

    if !json {
        println!();
        println!(
            "  {} Started '{}' instance {}",
            style("*").green().bold(),
            style(workflow).cyan(),
            style(handle.id()).bold()
        );
        println!("  Data: {}", style(state.data_dir.display()).dim());
    }

    let details = drive(&handle, timeout).await?;
    print_details(handle.id(), &details, json)
}

pub async fn handle_resume(state: &AppState, id: &str, timeout: u64, json: bool) -> Result<()> {
    let binding = state.binding_for_instance(id).await?;
    let handle = binding
        .recover(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resume instance: {e}"))?;

    if !json {
        println!();
        println!(
            "  {} Resuming '{}' instance {}",
            style("*").green().bold(),
            style(binding.workflow_name()).cyan(),
            style(id).bold()
        );
    }

    let details = drive(&handle, timeout).await?;
    print_details(id, &details, json)
}

pub async fn handle_send_event(
    state: &AppState,
    id: &str,
    event_type: &str,
    payload: Option<&str>,
    timeout: u64,
    json: bool,
) -> Result<()> {
    let payload = parse_json(payload, "payload")?;
    let binding = state.binding_for_instance(id).await?;
    let handle = binding
        .get(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up instance: {e}"))?;

    handle
        .send_event(event_type, payload)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to deliver event: {e}"))?;

    if !json {
        println!();
        println!(
            "  {} Delivered '{}' to {}",
            style("*").green().bold(),
            style(event_type).cyan(),
            style(id).bold()
        );
    }

    let details = drive(&handle, timeout).await?;
    print_details(id, &details, json)
}

/// Drive an instance until it reaches a terminal status or `timeout_secs`
/// elapse. A still-running instance is aborted; its progress is durable.
async fn drive(handle: &InstanceHandle, timeout_secs: u64) -> Result<InstanceStatusDetails> {
    let settled = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        handle.wait_for_status(InstanceStatus::Complete),
    )
    .await;

    if settled.is_err() {
        tracing::info!(instance_id = %handle.id(), timeout_secs, "leaving instance suspended");
        handle.engine().abort("command timeout reached");
    }

    handle
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read instance status: {e}"))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, id: &str, json: bool) -> Result<()> {
    let binding = state.binding_for_instance(id).await?;
    let handle = binding
        .get(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up instance: {e}"))?;
    let details = handle
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read instance status: {e}"))?;

    if !json {
        println!();
    }
    print_details(id, &details, json)
}

fn print_details(id: &str, details: &InstanceStatusDetails, json: bool) -> Result<()> {
    if json {
        let mut out = serde_json::to_value(details)?;
        if let Value::Object(map) = &mut out {
            map.insert("id".to_string(), Value::String(id.to_string()));
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("  Status: {}", styled_status(details.status));
    if let Some(output) = &details.output {
        println!("  Output: {}", serde_json::to_string_pretty(output)?);
    }
    if let Some(error) = &details.error {
        println!("  Error:  {}", style(error).red());
    }
    if !details.status.is_terminal() {
        println!();
        println!(
            "  Continue with: {} or {}",
            style(format!("stepwise resume {id}")).dim(),
            style(format!("stepwise send-event {id} <type>")).dim()
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub async fn handle_logs(state: &AppState, id: &str, json: bool) -> Result<()> {
    let binding = state.binding_for_instance(id).await?;
    let logs = binding
        .engine(id)
        .read_logs()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read logs: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Event"),
            Cell::new("Target"),
            Cell::new("Time"),
            Cell::new("Details"),
        ]);

    for entry in &logs {
        table.add_row(vec![
            Cell::new(entry.id),
            event_cell(entry),
            Cell::new(entry.target.as_deref().unwrap_or("-")),
            Cell::new(entry.timestamp.format("%H:%M:%S%.3f").to_string()),
            Cell::new(details_summary(&entry.metadata)),
        ]);
    }

    println!();
    println!(
        "  Event log for {} ({} entries)",
        style(id).bold(),
        logs.len()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn event_cell(entry: &LogEntry) -> Cell {
    let name = entry.event.as_str();
    let color = if name.ends_with("FAILURE") || name.ends_with("TIMED_OUT") {
        Color::Red
    } else if name.ends_with("SUCCESS") || name.ends_with("COMPLETE") {
        Color::Green
    } else {
        Color::Reset
    };
    Cell::new(name).fg(color)
}

fn details_summary(metadata: &Value) -> String {
    match metadata {
        Value::Object(map) if map.is_empty() => String::new(),
        other => {
            let rendered = other.to_string();
            if rendered.chars().count() > DETAILS_WIDTH {
                let cut: String = rendered.chars().take(DETAILS_WIDTH - 3).collect();
                format!("{cut}...")
            } else {
                rendered
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

pub fn handle_workflows(state: &AppState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&demos::NAMES)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Workflow").fg(Color::Cyan), Cell::new("Version")]);

    for name in demos::NAMES {
        table.add_row(vec![Cell::new(name), Cell::new(format!("{name}@1"))]);
    }

    println!();
    println!("{table}");
    println!("  Data: {}", style(state.data_dir.display()).dim());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_json(raw: Option<&str>, what: &str) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid JSON {what}")),
        None => Ok(Value::Object(Default::default())),
    }
}

fn styled_status(status: InstanceStatus) -> console::StyledObject<&'static str> {
    let label = status.as_str();
    match status {
        InstanceStatus::Queued => style(label).yellow(),
        InstanceStatus::Running => style(label).blue(),
        InstanceStatus::Paused => style(label).magenta(),
        InstanceStatus::Complete => style(label).green(),
        InstanceStatus::Errored => style(label).red(),
        InstanceStatus::Terminated => style(label).red().dim(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_json_defaults_to_empty_object() {
        assert_eq!(parse_json(None, "params").unwrap(), json!({}));
        assert_eq!(parse_json(Some(r#"{"a":1}"#), "params").unwrap(), json!({"a": 1}));
        assert!(parse_json(Some("{nope"), "params").is_err());
    }

    #[test]
    fn test_details_summary_truncates() {
        assert_eq!(details_summary(&json!({})), "");
        assert_eq!(details_summary(&json!({"attempt": 1})), r#"{"attempt":1}"#);

        let long = details_summary(&json!({ "result": "x".repeat(200) }));
        assert_eq!(long.chars().count(), DETAILS_WIDTH);
        assert!(long.ends_with("..."));
    }
}
