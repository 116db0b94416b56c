//! Herald trigger: runs one unit of work and exits.
//!
//! Meant for cron or any external scheduler. Each invocation re-reads the
//! store, prints a JSON summary on stdout and exits non-zero only when the
//! whole run failed.
//!
//! Usage:
//!   herald-trigger campaigns
//!   herald-trigger rules --rule-type daily_reminder --force
//!   herald-trigger queue --limit 200
//!   herald-trigger reclaim

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::audience::PgAudienceSource;
use herald_engine::campaigns::CampaignScheduler;
use herald_engine::dispatcher::Dispatcher;
use herald_engine::queue::NotificationQueue;
use herald_engine::rules::{EvaluateOptions, RuleEngine};
use herald_engine::worker::{QueueProcessor, QueueSettings};

#[derive(Parser)]
#[command(name = "herald-trigger", version, about = "Run one Herald trigger and exit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send every due scheduled campaign
    Campaigns,

    /// Evaluate automated rules
    Rules {
        /// Only this rule (default: all active rules)
        #[arg(long)]
        rule_type: Option<String>,

        /// Fire regardless of time window and daily guard
        #[arg(long)]
        force: bool,

        /// Resolve audiences without enqueueing
        #[arg(long)]
        test_mode: bool,
    },

    /// Claim and deliver due queue entries
    Queue {
        /// Entries claimed this run (default: QUEUE_BATCH_SIZE)
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Only return stale `sending` entries to the queue
    Reclaim,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_trigger=info,herald_engine=info,herald_notifier=info".into()),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::from_env()?;
    tracing::info!(command = ?cli.command, "Herald trigger starting");
    let pool = create_pool(&config).await?;
    let queue = NotificationQueue::new(pool.clone(), config.queue_max_attempts);
    let now = Utc::now();

    match cli.command {
        Command::Rules {
            rule_type,
            force,
            test_mode,
        } => {
            let engine = RuleEngine::new(
                pool.clone(),
                queue,
                Arc::new(PgAudienceSource::new(pool)),
            );
            let summary = engine
                .process(rule_type.as_deref(), now, EvaluateOptions { force, test_mode })
                .await?;
            print_json(&summary)?;
        }
        Command::Reclaim => {
            let reclaimed = queue.reclaim_stale(now, config.stale_claim_timeout()).await?;
            print_json(&serde_json::json!({ "reclaimed": reclaimed }))?;
        }
        Command::Campaigns => {
            let redis = create_redis_pool(&config.redis_url).await?;
            let dispatcher = Arc::new(Dispatcher::from_config(pool.clone(), redis, &config)?);
            let scheduler = CampaignScheduler::new(
                pool.clone(),
                Arc::new(PgAudienceSource::new(pool)),
                dispatcher,
                config.stale_claim_timeout(),
            );
            print_json(&scheduler.run(now).await?)?;
        }
        Command::Queue { limit } => {
            let redis = create_redis_pool(&config.redis_url).await?;
            let dispatcher = Arc::new(Dispatcher::from_config(pool, redis, &config)?);
            let processor = QueueProcessor::new(queue, dispatcher, QueueSettings::from_config(&config));
            print_json(&processor.run_once(now, limit).await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_rules_flags_parse() {
        let cli = Cli::try_parse_from([
            "herald-trigger",
            "rules",
            "--rule-type",
            "daily_reminder",
            "--force",
        ])
        .unwrap();
        match cli.command {
            Command::Rules {
                rule_type,
                force,
                test_mode,
            } => {
                assert_eq!(rule_type.as_deref(), Some("daily_reminder"));
                assert!(force);
                assert!(!test_mode);
            }
            _ => panic!("expected rules subcommand"),
        }
    }

    #[test]
    fn test_queue_limit_parses() {
        let cli = Cli::try_parse_from(["herald-trigger", "queue", "--limit", "25"]).unwrap();
        assert!(matches!(cli.command, Command::Queue { limit: Some(25) }));
    }
}
