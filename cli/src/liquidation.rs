//! Liquidation queue operations

use anyhow::{Context, Result};
use chrono::Utc;
use colored::{ColoredString, Colorize};
use uuid::Uuid;

use wealth_keeper::liquidation::{parse_status_filter, ActionResult, OperatorAction, TaskFilter};
use wealth_keeper::types::TaskStatus;
use wealth_keeper::ControlPlane;

fn paint(status: TaskStatus) -> ColoredString {
    let text = status.as_str();
    match status {
        TaskStatus::Completed => text.green(),
        TaskStatus::Failed => text.red(),
        TaskStatus::Blocked => text.bright_red().bold(),
        TaskStatus::Retrying => text.yellow(),
        TaskStatus::Pending => text.normal(),
    }
}

pub fn parse_ids(raw: &[String]) -> Result<Vec<Uuid>> {
    raw.iter()
        .map(|s| Uuid::parse_str(s.trim()).with_context(|| format!("Invalid task id: {}", s)))
        .collect()
}

pub fn list_tasks(
    plane: &ControlPlane,
    statuses: Option<String>,
    subscription: Option<String>,
    wallet: Option<String>,
    due_only: bool,
    limit: Option<usize>,
) -> Result<()> {
    println!("{}", "=== Liquidation Tasks ===".bright_green().bold());
    let filter = TaskFilter {
        statuses: match statuses.as_deref() {
            Some(raw) => parse_status_filter(raw)?,
            None => None,
        },
        subscription_id: subscription
            .as_deref()
            .map(|s| Uuid::parse_str(s.trim()).with_context(|| format!("Invalid subscription id: {}", s)))
            .transpose()?,
        wallet_address: wallet,
        due_only,
        limit,
    };
    let listing = plane.queue.list(&filter, Utc::now());

    let summary = &listing.summary;
    println!("{} {}", "Total:".bright_cyan(), summary.total_count);
    println!("{} {}", "Due:".bright_cyan(), summary.due_count);
    let counts: Vec<String> = summary
        .by_status
        .iter()
        .map(|(s, n)| format!("{}={}", s, n))
        .collect();
    println!("{} {}", "By Status:".bright_cyan(), counts.join(" "));

    if listing.tasks.is_empty() {
        println!("\n{}", "No matching tasks".dimmed());
        return Ok(());
    }
    println!();
    for view in &listing.tasks {
        let t = &view.task;
        println!(
            "  {} {:<9} {} {:>12.4} sh  attempts {:<3}{}{}",
            t.id.to_string().dimmed(),
            paint(t.status),
            t.token_id,
            t.requested_shares,
            t.attempt_count,
            if view.is_due { " due".bright_yellow().to_string() } else { String::new() },
            t.error_code
                .as_deref()
                .map(|c| format!("  [{}]", c).dimmed().to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

pub fn apply_action(plane: &ControlPlane, action: OperatorAction, task_ids: &[String]) -> Result<()> {
    let ids = parse_ids(task_ids)?;
    let result = plane.health.apply_action(&action, &ids, Utc::now())?;
    print_result(&result);
    Ok(())
}

fn print_result(result: &ActionResult) {
    println!(
        "{}",
        format!("=== Operator {} ===", result.action).bright_green().bold()
    );
    println!("{} {}", "Requested:".bright_cyan(), result.requested_count);
    println!("{} {}", "Updated:".bright_cyan(), result.updated_count);
    for t in &result.tasks {
        println!(
            "  {} {} attempts {} {}",
            t.id.to_string().dimmed(),
            paint(t.status),
            t.attempt_count,
            t.next_retry_at
                .map(|at| format!("next {}", at.format("%H:%M:%S")))
                .unwrap_or_default()
                .dimmed()
        );
    }
    if result.updated_count < result.requested_count {
        println!(
            "\n{}",
            "Some tasks were unchanged (terminal, unknown, or not eligible)".yellow()
        );
    }
}
