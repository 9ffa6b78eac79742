//! Subscription operations

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use uuid::Uuid;

use wealth_keeper::lifecycle::NewSubscription;
use wealth_keeper::positions::{ExecutionFill, Side};
use wealth_keeper::types::SubscriptionStatus;
use wealth_keeper::{ControlPlane, KeeperError};

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).with_context(|| format!("Invalid subscription id: {}", raw))
}

pub async fn create(plane: &ControlPlane, req: NewSubscription) -> Result<()> {
    println!("{}", "=== Create Subscription ===".bright_green().bold());
    match plane.lifecycle.create(req, Utc::now()).await {
        Ok(created) => {
            let s = &created.subscription;
            println!("{} {}", "Subscription:".bright_cyan(), s.id);
            println!("{} {}", "Wallet:".bright_cyan(), s.wallet_address);
            println!("{} {} / {}", "Product:".bright_cyan(), s.product_id, s.term_id);
            println!("{} {:.2}", "Principal:".bright_cyan(), s.principal);
            println!("{} {}", "Ends:".bright_cyan(), s.end_at.format("%Y-%m-%d %H:%M"));
            if let Some(y) = s.guaranteed_min_yield {
                println!("{} {:.2}%", "Guaranteed Yield:".bright_cyan(), y * 100.0);
            }
            if created.marketing.trial_applied {
                println!("  {} trial applied, fee waived", "★".bright_yellow());
            }
            if created.marketing.referral_bonus_applied {
                println!("  {} referrer bonus granted", "★".bright_yellow());
            }
            Ok(())
        }
        Err(KeeperError::ReserveCoverage { coverage, required_ratio }) => {
            println!("{}", "Rejected: reserve coverage too low".red().bold());
            println!("{} {:.2}", "Balance:".bright_cyan(), coverage.balance);
            println!("{} {:.2}", "Projected Liability:".bright_cyan(), coverage.projected_liability);
            println!(
                "{} {:.4} (required {:.2})",
                "Coverage Ratio:".bright_cyan(),
                coverage.coverage_ratio,
                required_ratio
            );
            anyhow::bail!("subscription rejected by coverage guard")
        }
        Err(e) => Err(e.into()),
    }
}

pub fn list(plane: &ControlPlane, wallet: Option<String>, status: Option<String>) -> Result<()> {
    println!("{}", "=== Subscriptions ===".bright_green().bold());
    let status = status
        .as_deref()
        .map(|s| s.parse::<SubscriptionStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let views = plane.lifecycle.list(wallet.as_deref(), status);
    if views.is_empty() {
        println!("\n{}", "No subscriptions".dimmed());
        return Ok(());
    }
    for v in views {
        let s = &v.subscription;
        println!(
            "  {} {:<9} {} {:>12.2} -> {:>12.2}  hwm {:.2}",
            s.id.to_string().dimmed(),
            s.status.as_str().bright_yellow(),
            s.wallet_address,
            s.principal,
            s.current_equity,
            s.high_water_mark
        );
        if let Some(last) = v.nav_snapshots.last() {
            println!(
                "      nav {:.4}  drawdown {:.2}%{}",
                last.nav,
                last.drawdown * 100.0,
                if last.is_fallback_price { " (fallback marks)".dimmed().to_string() } else { String::new() }
            );
        }
        if let Some(settlement) = &v.settlement {
            println!(
                "      settled {} payout {:.2} fee {:.2}",
                settlement.settled_at.format("%Y-%m-%d"),
                settlement.final_payout,
                settlement.performance_fee
            );
        }
    }
    Ok(())
}

pub async fn cancel(plane: &ControlPlane, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let sub = plane.lifecycle.cancel(id, Utc::now()).await?;
    println!("{} {} {}", "✓".green(), sub.id, "cancelled".bright_yellow());
    let open = plane.store.read(|t| t.tasks_for(id).filter(|task| !task.status.is_terminal()).count());
    if open > 0 {
        println!("  {} liquidation task(s) queued", open);
    }
    Ok(())
}

pub async fn settle(plane: &ControlPlane, id: &str) -> Result<()> {
    println!("{}", "=== Settle Subscription ===".bright_green().bold());
    let record = plane.lifecycle.settle(parse_id(id)?, Utc::now()).await?;
    println!("{} {}", "Settlement:".bright_cyan(), record.id);
    println!("{} {:.2}", "Final Equity:".bright_cyan(), record.final_equity);
    println!("{} {:.2}", "Gross PnL:".bright_cyan(), record.gross_pnl);
    println!("{} {:.2}", "Performance Fee:".bright_cyan(), record.performance_fee);
    if record.reserve_topup > 0.0 {
        println!("{} {:.2}", "Reserve Top-up:".bright_cyan(), record.reserve_topup);
    }
    println!("{} {:.2}", "Final Payout:".bright_cyan(), record.final_payout);
    Ok(())
}

pub fn add_referral(plane: &ControlPlane, referee: &str, referrer: &str) -> Result<()> {
    let referral = plane.lifecycle.register_referral(referee, referrer)?;
    println!(
        "{} {} referred by {}",
        "✓".green(),
        referral.referee_wallet,
        referral.referrer_wallet
    );
    Ok(())
}

pub fn record_fill(plane: &ControlPlane, subscription: &str, token: String, side: Side, shares: f64, price: f64) -> Result<()> {
    let fill = ExecutionFill {
        subscription_id: parse_id(subscription)?,
        token_id: token,
        side,
        shares,
        price,
    };
    let realized = plane.lifecycle.apply_fill(&fill)?;
    println!(
        "{} {:?} {} {} @ {} (realized {:.4})",
        "✓".green(),
        fill.side,
        fill.shares,
        fill.token_id,
        fill.price,
        realized
    );
    Ok(())
}
