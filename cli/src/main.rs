//! wealthctl - operator CLI for the managed-wealth control plane
//!
//! Runs the keeper (HTTP surface plus background jobs) and exposes the same
//! operations for one-off use against a local state file.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::sync::Arc;

mod config;
mod keeper;
mod liquidation;
mod reserve;
mod server;
mod subscription;

use wealth_keeper::health::HealthQuery;
use wealth_keeper::lifecycle::NewSubscription;
use wealth_keeper::liquidation::OperatorAction;
use wealth_keeper::positions::Side;
use wealth_keeper::types::ReserveEntryType;

#[derive(Parser)]
#[command(name = "wealthctl")]
#[command(about = "Managed wealth reserve and liquidation control plane", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "WEALTH_CONFIG")]
    config: Option<String>,

    /// State file (defaults to in-memory, lost on exit)
    #[arg(short, long, env = "WEALTH_STATE")]
    state: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP surface and the background jobs
    Serve {
        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Serve HTTP only, without background jobs
        #[arg(long)]
        no_jobs: bool,
    },

    /// Keeper job operations
    Keeper {
        #[command(subcommand)]
        command: KeeperCommands,
    },

    /// Operator health snapshot
    Health {
        #[arg(long)]
        window_days: Option<i64>,

        #[arg(long)]
        liquidation_limit: Option<usize>,

        #[arg(long)]
        parity_limit: Option<usize>,

        #[arg(long)]
        stale_mapping_minutes: Option<i64>,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },

    /// Reserve fund operations
    Reserve {
        #[command(subcommand)]
        command: ReserveCommands,
    },

    /// Guarantee coverage operations
    Coverage {
        #[command(subcommand)]
        command: CoverageCommands,
    },

    /// Subscription operations
    Subscription {
        #[command(subcommand)]
        command: SubscriptionCommands,
    },

    /// Referral operations
    Referral {
        #[command(subcommand)]
        command: ReferralCommands,
    },

    /// Record an execution fill against a subscription
    Fill {
        /// Subscription ID
        subscription: String,

        /// Outcome token
        token: String,

        #[arg(value_enum)]
        side: SideArg,

        shares: f64,

        price: f64,
    },

    /// Liquidation queue operations
    Liquidation {
        #[command(subcommand)]
        command: LiquidationCommands,
    },
}

#[derive(Subcommand)]
enum KeeperCommands {
    /// Run the background jobs until Ctrl+C (no HTTP)
    Run,

    /// Run every job once and exit
    Once,
}

#[derive(Subcommand)]
enum ReserveCommands {
    /// Deposit into the reserve
    Deposit {
        amount: f64,

        #[arg(long)]
        note: Option<String>,
    },

    /// Withdraw from the reserve
    Withdraw {
        amount: f64,

        #[arg(long)]
        note: Option<String>,
    },

    /// Top up the reserve
    Topup {
        amount: f64,

        #[arg(long)]
        note: Option<String>,
    },

    /// Show the reserve balance
    Balance,

    /// Show recent ledger entries
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show balance, totals and per-product coverage
    Summary,
}

#[derive(Subcommand)]
enum CoverageCommands {
    /// Check whether a new guaranteed principal would be accepted
    Check {
        /// Product ID or slug
        product: String,

        principal: f64,

        /// Minimum yield rate of the term (e.g. 0.05)
        #[arg(long)]
        min_yield: Option<f64>,
    },
}

#[derive(Subcommand)]
enum SubscriptionCommands {
    /// Create a subscription
    Create {
        wallet: String,

        /// Product ID or slug
        product: String,

        /// Term ID
        term: String,

        principal: f64,

        /// Copy-trading config to map the subscription to
        #[arg(long)]
        copy_config: Option<String>,

        /// Accept the product terms
        #[arg(long)]
        accept_terms: bool,
    },

    /// List subscriptions
    List {
        #[arg(long)]
        wallet: Option<String>,

        #[arg(long)]
        status: Option<String>,
    },

    /// Cancel a subscription early
    Cancel { id: String },

    /// Settle a matured or cancelled subscription
    Settle { id: String },
}

#[derive(Subcommand)]
enum ReferralCommands {
    /// Record that `referee` was referred by `referrer`
    Add { referee: String, referrer: String },
}

#[derive(Subcommand)]
enum LiquidationCommands {
    /// List tasks
    List {
        /// Comma-separated statuses; omit for all statuses
        #[arg(long)]
        statuses: Option<String>,

        #[arg(long)]
        subscription: Option<String>,

        #[arg(long)]
        wallet: Option<String>,

        /// Only tasks due for execution
        #[arg(long)]
        due: bool,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Schedule tasks for another attempt
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,

        /// Seconds before the task becomes due
        #[arg(long, default_value = "0")]
        delay: i64,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Reset tasks to PENDING with a fresh attempt budget
    Requeue {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Mark tasks as FAILED
    Fail {
        #[arg(required = true)]
        ids: Vec<String>,

        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    if cli.verbose {
        println!("{} {}", "Config:".bright_cyan(), cli.config.as_deref().unwrap_or("(defaults)"));
        println!("{} {}", "State:".bright_cyan(), cli.state.as_deref().unwrap_or("(in-memory)"));
        println!(
            "{} {}",
            "Prices:".bright_cyan(),
            config.price_url.as_deref().unwrap_or("(static marks)")
        );
    }

    let plane = config::build_plane(config, cli.state.as_deref())?;

    match cli.command {
        Commands::Serve { bind, no_jobs } => {
            keeper::run(Arc::new(plane), bind, no_jobs).await?;
        }
        Commands::Keeper { command } => match command {
            KeeperCommands::Run => keeper::run_jobs(Arc::new(plane)).await?,
            KeeperCommands::Once => keeper::run_once(&plane).await?,
        },
        Commands::Health {
            window_days,
            liquidation_limit,
            parity_limit,
            stale_mapping_minutes,
            json,
        } => {
            let query = HealthQuery {
                window_days,
                liquidation_limit,
                parity_limit,
                stale_mapping_minutes,
            };
            keeper::show_health(&plane, query, json).await?;
        }
        Commands::Reserve { command } => match command {
            ReserveCommands::Deposit { amount, note } => {
                reserve::record(&plane, ReserveEntryType::Deposit, amount, note)?;
            }
            ReserveCommands::Withdraw { amount, note } => {
                reserve::record(&plane, ReserveEntryType::Withdraw, amount, note)?;
            }
            ReserveCommands::Topup { amount, note } => {
                reserve::record(&plane, ReserveEntryType::Topup, amount, note)?;
            }
            ReserveCommands::Balance => reserve::show_balance(&plane)?,
            ReserveCommands::History { limit } => reserve::show_history(&plane, limit)?,
            ReserveCommands::Summary => reserve::show_summary(&plane)?,
        },
        Commands::Coverage { command } => match command {
            CoverageCommands::Check { product, principal, min_yield } => {
                reserve::check_coverage(&plane, &product, principal, min_yield)?;
            }
        },
        Commands::Subscription { command } => match command {
            SubscriptionCommands::Create {
                wallet,
                product,
                term,
                principal,
                copy_config,
                accept_terms,
            } => {
                let req = NewSubscription {
                    wallet_address: wallet,
                    product_id: Some(product),
                    product_slug: None,
                    term_id: term,
                    principal,
                    accepted_terms: accept_terms,
                    copy_config_id: copy_config,
                };
                subscription::create(&plane, req).await?;
            }
            SubscriptionCommands::List { wallet, status } => subscription::list(&plane, wallet, status)?,
            SubscriptionCommands::Cancel { id } => subscription::cancel(&plane, &id).await?,
            SubscriptionCommands::Settle { id } => subscription::settle(&plane, &id).await?,
        },
        Commands::Referral { command } => match command {
            ReferralCommands::Add { referee, referrer } => {
                subscription::add_referral(&plane, &referee, &referrer)?;
            }
        },
        Commands::Fill { subscription: id, token, side, shares, price } => {
            subscription::record_fill(&plane, &id, token, side.into(), shares, price)?;
        }
        Commands::Liquidation { command } => match command {
            LiquidationCommands::List { statuses, subscription, wallet, due, limit } => {
                liquidation::list_tasks(&plane, statuses, subscription, wallet, due, limit)?;
            }
            LiquidationCommands::Retry { ids, delay, reason } => {
                let action = OperatorAction::Retry { delay_seconds: delay, reason };
                liquidation::apply_action(&plane, action, &ids)?;
            }
            LiquidationCommands::Requeue { ids } => {
                liquidation::apply_action(&plane, OperatorAction::Requeue, &ids)?;
            }
            LiquidationCommands::Fail { ids, reason } => {
                liquidation::apply_action(&plane, OperatorAction::Fail { reason }, &ids)?;
            }
        },
    }

    Ok(())
}
