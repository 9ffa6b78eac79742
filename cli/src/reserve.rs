//! Reserve fund operations

use anyhow::Result;
use chrono::Utc;
use colored::Colorize;

use wealth_keeper::types::ReserveEntryType;
use wealth_keeper::ControlPlane;

pub fn record(plane: &ControlPlane, entry_type: ReserveEntryType, amount: f64, note: Option<String>) -> Result<()> {
    println!("{}", format!("=== Reserve {} ===", entry_type).bright_green().bold());
    let entry = plane.ledger.append(entry_type, amount, note, Utc::now())?;
    println!("{} {}", "Entry:".bright_cyan(), entry.id);
    println!("{} {:.2}", "Amount:".bright_cyan(), entry.amount);
    println!("{} {:.2}", "Balance:".bright_cyan(), plane.ledger.balance());
    Ok(())
}

pub fn show_balance(plane: &ControlPlane) -> Result<()> {
    println!("{}", "=== Reserve Fund Balance ===".bright_green().bold());
    println!("{} {:.2}", "Balance:".bright_cyan(), plane.ledger.balance());
    Ok(())
}

pub fn show_history(plane: &ControlPlane, limit: usize) -> Result<()> {
    println!("{}", "=== Reserve Fund History ===".bright_green().bold());
    let entries = plane.ledger.entries(limit);
    if entries.is_empty() {
        println!("\n{}", "No ledger entries".dimmed());
        return Ok(());
    }
    for e in entries {
        let amount = format!("{:>14.2}", e.amount);
        let amount = if e.entry_type.direction() == wealth_model::Direction::Credit {
            amount.green()
        } else {
            amount.red()
        };
        println!(
            "  {} {:<17} {} {}",
            e.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            e.entry_type,
            amount,
            e.note.unwrap_or_default().dimmed()
        );
    }
    Ok(())
}

pub fn show_summary(plane: &ControlPlane) -> Result<()> {
    println!("{}", "=== Reserve Fund Summary ===".bright_green().bold());
    let summary = plane.ledger.summary();
    println!("{} {:.2}", "Balance:".bright_cyan(), summary.balance);
    println!("{} {}", "Entries:".bright_cyan(), summary.entry_count);
    for (entry_type, total) in &summary.totals {
        println!("  {} {:.2}", format!("{}:", entry_type).bright_yellow(), total);
    }

    println!("\n{}", "Guarantee coverage:".bright_yellow());
    let coverage = plane.guard.product_coverage(&plane.catalog);
    if coverage.is_empty() {
        println!("  {}", "No guaranteed products configured".dimmed());
    }
    for c in coverage {
        let required = plane
            .catalog
            .find(&c.product_id)
            .map_or(1.0, |p| p.reserve_coverage_min);
        let ratio = if c.coverage_ratio.is_finite() {
            format!("{:.4}", c.coverage_ratio)
        } else {
            "unbounded".to_string()
        };
        let ratio = if c.coverage_ratio >= required { ratio.green() } else { ratio.red() };
        println!(
            "  {} liability {:.2}, ratio {} (min {:.2})",
            c.product_id.bright_cyan(),
            c.existing_liability,
            ratio,
            required
        );
    }
    Ok(())
}

pub fn check_coverage(plane: &ControlPlane, product: &str, principal: f64, min_yield: Option<f64>) -> Result<()> {
    println!("{}", "=== Coverage Check ===".bright_green().bold());
    let Some(p) = plane.catalog.find(product) else {
        anyhow::bail!("Unknown product: {}", product);
    };
    let report = plane.guard.check_coverage(&p.id, principal, min_yield);
    println!("{} {}", "Product:".bright_cyan(), p.id);
    println!("{} {:.2}", "Balance:".bright_cyan(), report.balance);
    println!("{} {:.2}", "Existing Liability:".bright_cyan(), report.existing_liability);
    println!("{} {:.2}", "Additional Liability:".bright_cyan(), report.additional_liability);
    println!("{} {:.4}", "Coverage Ratio:".bright_cyan(), report.coverage_ratio);
    if report.coverage_ratio >= p.reserve_coverage_min {
        println!("\n{} accepted at minimum {:.2}", "✓".green(), p.reserve_coverage_min);
    } else {
        println!("\n{} rejected, minimum is {:.2}", "✗".red(), p.reserve_coverage_min);
    }
    Ok(())
}
