use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use community_rewards::{
    config::Settings,
    models::{CycleKind, Payout, QuarterLabel, RewardTier},
    settlement::{RetryConfig, RewardsEngine, SettlementScheduler},
    store::{SqliteStore, StorageContext},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "rewards-engine")]
#[clap(about = "Rank participants and settle weekly and quarterly rewards", long_about = None)]
struct Cli {
    /// Settings file, overriding config/default and config/local
    #[clap(short, long)]
    config: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a participant
    Register {
        #[clap(short, long)]
        id: String,

        #[clap(short, long)]
        name: String,
    },

    /// Award points to a participant for the running week
    Award {
        #[clap(short, long)]
        id: String,

        #[clap(short, long)]
        points: u64,
    },

    /// Show the leaderboard of the current cycle
    Leaderboard {
        /// weekly or quarterly
        #[clap(short, long, default_value = "weekly")]
        kind: String,

        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show a participant's rank in the current cycle
    Rank {
        #[clap(short, long)]
        id: String,

        #[clap(short, long, default_value = "weekly")]
        kind: String,
    },

    /// Stage payouts for the next weekly cycle, e.g. --tier top1=500:50
    StageConfig {
        #[clap(short, long, required = true)]
        tier: Vec<String>,
    },

    /// Discard the staged configuration
    DeletePending,

    /// Observe the weekly boundary now
    Apply,

    /// Settle one cycle explicitly
    Settle {
        #[clap(short, long)]
        kind: String,

        /// Last day of the week (YYYY-MM-DD) or a quarter label (YYYY-Qn)
        #[clap(long)]
        cycle_end: String,
    },

    /// Community quarter goals
    Quarter {
        #[clap(subcommand)]
        command: QuarterCommands,
    },

    /// Run the settlement scheduler until interrupted
    Serve,
}

#[derive(Subcommand)]
enum QuarterCommands {
    /// Queue a goal for a quarter
    Create {
        /// Quarter label, e.g. 2026-Q4
        #[clap(short, long)]
        quarter: String,

        #[clap(short, long)]
        title: String,

        #[clap(short, long, default_value = "")]
        description: String,

        #[clap(long)]
        target: u64,
    },

    /// Contribute units to the quarter open now
    Contribute {
        #[clap(short, long)]
        id: String,

        #[clap(short, long)]
        units: u64,
    },

    Progress {
        #[clap(short, long)]
        quarter: String,
    },

    Leaderboard {
        #[clap(short, long)]
        quarter: String,

        #[clap(short, long, default_value = "10")]
        limit: usize,
    },

    /// Settle every quarter that has ended
    Settle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path))?,
        None => Settings::new().unwrap_or_else(|e| {
            eprintln!("Using default settings: {}", e);
            Settings::default()
        }),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.app.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = settings.validate() {
        error!("Invalid settings: {}", e);
        return Err(anyhow::anyhow!(e));
    }

    let store = SqliteStore::open(&settings.database.url, settings.database.max_connections)
        .await
        .with_context(|| format!("Failed to open database {}", settings.database.url))?;
    let storage = StorageContext::new(Arc::new(store));
    let engine = Arc::new(RewardsEngine::from_settings(storage, &settings).await?);

    match cli.command {
        Commands::Register { id, name } => {
            let participant = engine.register_participant(&id, &name).await?;
            println!(
                "{} ({}) score={} balance={}",
                participant.id, participant.display_name, participant.score, participant.balance
            );
        }

        Commands::Award { id, points } => {
            let participant = engine.award_points(&id, points).await?;
            println!("{} now has {} points", participant.id, participant.score);
        }

        Commands::Leaderboard { kind, limit } => {
            let kind = parse_kind(&kind)?;
            let board = engine.get_leaderboard(kind, limit, Utc::now()).await?;
            println!("{} leaderboard", kind.as_str());
            for entry in board {
                println!("{:>4}  {:<24} {}", entry.rank, entry.participant_id, entry.score);
            }
        }

        Commands::Rank { id, kind } => {
            let kind = parse_kind(&kind)?;
            match engine.get_user_rank(&id, kind, Utc::now()).await? {
                Some(entry) => println!("{} is ranked {} with {}", id, entry.rank, entry.score),
                None => println!("{} is not ranked in the current {} cycle", id, kind.as_str()),
            }
        }

        Commands::StageConfig { tier } => {
            let tiers = tier
                .iter()
                .map(|arg| parse_tier(arg))
                .collect::<anyhow::Result<BTreeMap<_, _>>>()?;
            let pending = engine.save_or_update_pending_config(tiers).await?;
            println!("Staged configuration for the next cycle:");
            for (tier, payout) in &pending.tiers {
                println!(
                    "  {:<10} currency={} score={}",
                    tier, payout.bonus_currency, payout.bonus_score
                );
            }
        }

        Commands::DeletePending => {
            if engine.delete_pending_config().await? {
                println!("Pending configuration deleted");
            } else {
                println!("No pending configuration");
            }
        }

        Commands::Apply => {
            let outcome = engine.apply_pending_config_if_needed(Utc::now()).await?;
            if let Some(result) = &outcome.distribution {
                println!(
                    "Settled {}: {} participants, {} currency",
                    result.cycle_id, result.total_participants, result.total_currency_distributed
                );
            }
            match (outcome.applied, outcome.reason) {
                (true, _) => println!("Pending configuration promoted"),
                (false, Some(reason)) => println!("Nothing promoted: {}", reason),
                (false, None) => println!("Nothing promoted"),
            }
        }

        Commands::Settle { kind, cycle_end } => {
            let kind = parse_kind(&kind)?;
            let window = match kind {
                CycleKind::Weekly => {
                    let last_day = NaiveDate::parse_from_str(&cycle_end, "%Y-%m-%d")
                        .with_context(|| format!("Invalid date {}", cycle_end))?;
                    engine.calculator().weekly_window_ending(last_day)?
                }
                CycleKind::Quarterly => {
                    let label: QuarterLabel = cycle_end.parse()?;
                    engine.calculator().quarter_window(&label)?
                }
            };

            match engine.settle(kind, &window).await {
                Ok(result) => println!(
                    "Settled {}: {} participants, {} currency, {} score",
                    result.cycle_id,
                    result.total_participants,
                    result.total_currency_distributed,
                    result.total_score_distributed
                ),
                Err(e) if e.is_already_settled() => println!("{}", e),
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Quarter { command } => run_quarter(&engine, &settings, command).await?,

        Commands::Serve => {
            let scheduler = SettlementScheduler::new(
                engine.clone(),
                settings.scheduler_interval(),
                RetryConfig::from(&settings.scheduler),
            );

            info!("Starting {} v{}", settings.app.name, settings.app.version);
            scheduler
                .run(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for shutdown signal: {}", e);
                    }
                })
                .await;
        }
    }

    Ok(())
}

async fn run_quarter(
    engine: &RewardsEngine,
    settings: &Settings,
    command: QuarterCommands,
) -> anyhow::Result<()> {
    let tracker = engine.quarters();

    match command {
        QuarterCommands::Create { quarter, title, description, target } => {
            let label: QuarterLabel = quarter.parse()?;
            let goal = tracker
                .create_quarter(label, title, description, target, settings.default_reward_config())
                .await?;
            println!("Created {} \"{}\" with target {}", goal.id, goal.title, goal.target_units);
        }

        QuarterCommands::Contribute { id, units } => {
            let progress = tracker.contribute(&id, units, Utc::now()).await?;
            println!(
                "{}: {}/{} ({:.1}%)",
                progress.quarter, progress.current_units, progress.target_units, progress.percent
            );
        }

        QuarterCommands::Progress { quarter } => {
            let label: QuarterLabel = quarter.parse()?;
            let progress = tracker.progress(&label).await?;
            println!(
                "{}: {}/{} ({:.1}%), {} contributors, goal reached: {}",
                progress.quarter,
                progress.current_units,
                progress.target_units,
                progress.percent,
                progress.contributors,
                progress.goal_reached
            );
        }

        QuarterCommands::Leaderboard { quarter, limit } => {
            let label: QuarterLabel = quarter.parse()?;
            for entry in tracker.leaderboard(&label, limit).await? {
                println!("{:>4}  {:<24} {}", entry.rank, entry.participant_id, entry.score);
            }
        }

        QuarterCommands::Settle => {
            let settled = engine.settle_ended_quarters(Utc::now()).await?;
            if settled.is_empty() {
                println!("No quarter awaiting settlement");
            }
            for result in settled {
                println!("Settled {}: {} participants", result.cycle_id, result.total_participants);
            }
        }
    }

    Ok(())
}

fn parse_kind(kind: &str) -> anyhow::Result<CycleKind> {
    CycleKind::from_str(kind).ok_or_else(|| {
        anyhow::anyhow!("Unknown cycle kind {}, expected weekly or quarterly", kind)
    })
}

/// Parse `top1=500:50` into a tier and its payout.
fn parse_tier(arg: &str) -> anyhow::Result<(RewardTier, Payout)> {
    let (name, amounts) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected TIER=CURRENCY:SCORE, got {}", arg))?;
    let (currency, score) = amounts
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Expected CURRENCY:SCORE, got {}", amounts))?;

    let tier = RewardTier::from_str(name.trim())
        .ok_or_else(|| anyhow::anyhow!("Unknown tier {}", name))?;
    Ok((tier, Payout::new(currency.trim().parse()?, score.trim().parse()?)))
}
