//! Background jobs and the health report

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use std::sync::Arc;

use wealth_keeper::health::{HealthQuery, HealthSnapshot};
use wealth_keeper::jobs;
use wealth_keeper::ControlPlane;

use crate::server::{self, AppState};

/// Run the HTTP surface and, unless `no_jobs`, the periodic jobs until Ctrl+C.
pub async fn run(plane: Arc<ControlPlane>, bind: Option<String>, no_jobs: bool) -> Result<()> {
    let bind = bind.unwrap_or_else(|| plane.config.server.bind.clone());
    println!("{}", "=== Starting Wealth Keeper ===".bright_green().bold());
    println!("{} {}", "Listening:".bright_cyan(), bind);
    println!("{} {}", "Products:".bright_cyan(), plane.catalog.products().len());
    println!("{} {}", "Jobs:".bright_cyan(), if no_jobs { "disabled" } else { "enabled" });
    if plane.config.server.admin_token.is_none() {
        println!("{}", "No admin token configured: admin endpoints will reject every request".yellow());
    }
    println!("{}", "(Press Ctrl+C to stop)".dimmed());

    let handles = (!no_jobs).then(|| jobs::spawn(plane.clone()));
    let state = Arc::new(AppState {
        admin_token: plane.config.server.admin_token.clone(),
        plane,
    });

    tokio::select! {
        res = server::serve(state, &bind) => res?,
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "Shutting down...".bright_yellow());
        }
    }
    if let Some(handles) = handles {
        handles.shutdown().await;
    }
    Ok(())
}

/// One pass of NAV sampling, settlement and liquidation.
pub async fn run_once(plane: &ControlPlane) -> Result<()> {
    println!(
        "{}",
        format!("[{}] Running one keeper pass...", chrono::Local::now().format("%H:%M:%S")).dimmed()
    );
    let report = jobs::run_once(plane).await;
    println!("{} {}", "NAV Snapshots:".bright_cyan(), report.nav_snapshots);
    println!(
        "{} {} matured, {} settled, {} waiting, {} task(s) queued",
        "Settlement:".bright_cyan(),
        report.settlement.matured,
        report.settlement.settled,
        report.settlement.waiting,
        report.settlement.liquidation_tasks_created
    );
    let l = &report.liquidation;
    println!(
        "{} {} claimed, {} completed, {} retrying, {} blocked, {} failed",
        "Liquidation:".bright_cyan(),
        l.claimed,
        l.completed,
        l.retrying,
        l.blocked,
        l.failed
    );
    Ok(())
}

pub async fn show_health(plane: &ControlPlane, query: HealthQuery, json: bool) -> Result<()> {
    let params = query.resolve()?;
    let snapshot = plane.health.snapshot(params, Utc::now()).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    print_health(&snapshot);
    Ok(())
}

fn print_health(h: &HealthSnapshot) {
    println!("{}", "=== Managed Settlement Health ===".bright_green().bold());
    let verdict = if h.healthy { "HEALTHY".green().bold() } else { "ATTENTION".red().bold() };
    println!("{} {}", "Status:".bright_cyan(), verdict);
    println!("{} {:.2}", "Reserve Balance:".bright_cyan(), h.reserve.balance);

    println!("\n{}", "Coverage:".bright_yellow());
    for c in &h.coverage {
        let mark = if c.below_minimum { "✗".red() } else { "✓".green() };
        println!(
            "  {} {} ratio {:.4} (min {:.2}), liability {:.2}",
            mark, c.report.product_id, c.report.coverage_ratio, c.required_ratio, c.report.existing_liability
        );
    }

    let l = &h.liquidation;
    println!("\n{}", "Liquidation:".bright_yellow());
    println!("  {} {}", "Open:".bright_cyan(), l.open_count);
    println!("  {} {}", "Due:".bright_cyan(), l.due_count);
    println!("  {} {}", "Blocked:".bright_cyan(), l.blocked_count);
    for b in &l.backlog {
        println!(
            "    {} {} {} waiting {}m{}",
            "├─".dimmed(),
            b.task_id.to_string().dimmed(),
            b.status,
            b.waiting_minutes,
            b.error_code.as_deref().map(|c| format!(" [{}]", c)).unwrap_or_default()
        );
    }

    let p = &h.parity;
    println!("\n{}", format!("Settlement Parity ({}d):", p.window_days).bright_yellow());
    println!("  {} {}", "Checked:".bright_cyan(), p.checked_settlements);
    println!("  {} {}", "Matched:".bright_cyan(), p.matched_count);
    println!("  {} {}", "Missing Fees:".bright_cyan(), p.missing_count);
    println!("  {} {}", "Fee Mismatches:".bright_cyan(), p.mismatch_count);
    for m in &p.fee_mismatches {
        println!("    {} {} drift {:+.6} ({} log rows)", "├─".dimmed(), m.trade_id, m.drift, m.log_count);
    }
    if !p.errors.is_empty() {
        println!("  {} {}", "Lookup Errors:".red(), p.errors.len());
    }

    let a = &h.allocation;
    println!("\n{}", "Allocation Mapping:".bright_yellow());
    println!("  {} {}", "In Scope:".bright_cyan(), a.execution_scope_subscriptions);
    println!("  {} {}", "Mapped:".bright_cyan(), a.mapped_count);
    println!("  {} {}", "Unmapped:".bright_cyan(), a.unmapped_count);
    for s in &a.stale_unmapped {
        println!(
            "    {} {} {} unmapped for {}m",
            "├─".dimmed(),
            s.subscription_id.to_string().dimmed(),
            s.wallet_address,
            s.age_minutes
        );
    }
}

/// Run only the background jobs until Ctrl+C.
pub async fn run_jobs(plane: Arc<ControlPlane>) -> Result<()> {
    println!("{}", "=== Starting Keeper Jobs ===".bright_green().bold());
    println!("{}", "(Press Ctrl+C to stop)".dimmed());
    let handles = jobs::spawn(plane);
    tokio::signal::ctrl_c().await?;
    println!("\n{}", "Shutting down...".bright_yellow());
    handles.shutdown().await;
    Ok(())
}
