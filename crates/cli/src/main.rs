//! Questline CLI - quest tracker with dependencies and recurring quests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use questline_core::{
    Quest, QuestFilter, QuestId, QuestStatus, Rarity, RecurrenceType, SortKey, SortOrder,
    SubtaskKind, SubtaskSpec, TemplateId, TemplateSpec, Time, UserId,
};
use questline_execution::{Scheduler, SchedulerConfig, Transition};
use questline_service::{QuestService, QuestSpec};
use questline_storage::{JsonStorage, SqliteStorage, Storage};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "questline")]
#[command(about = "Quest tracker with dependencies and recurring quests", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: AppConfig,

    #[command(subcommand)]
    command: Commands,
}

/// Settings resolved once at start-up.
#[derive(clap::Args)]
struct AppConfig {
    /// Directory for the JSON store and the default database file
    #[arg(long, global = true, env = "QUESTLINE_DATA_DIR", default_value = ".questline")]
    data_dir: PathBuf,

    /// Storage backend
    #[arg(
        long,
        global = true,
        env = "QUESTLINE_BACKEND",
        value_enum,
        default_value_t = Backend::Json
    )]
    backend: Backend,

    /// SQLite URL, defaults to `sqlite://<data-dir>/questline.db`
    #[arg(long, global = true, env = "QUESTLINE_DATABASE_URL")]
    database_url: Option<String>,

    /// Seconds between scheduler sweeps
    #[arg(
        long,
        global = true,
        env = "QUESTLINE_POLL_INTERVAL_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_secs: u64,

    /// User whose quests to operate on
    #[arg(long, global = true, env = "QUESTLINE_USER", default_value = "local")]
    user: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Json,
    Sqlite,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new quest
    Add {
        /// Quest title
        title: String,
        /// Rarity (common, uncommon, rare, epic, legendary)
        #[arg(long, default_value = "common")]
        rarity: Rarity,
        /// Reward credited on completion
        #[arg(long, default_value = "0")]
        cost: u32,
        /// Deadline, RFC 3339 (e.g. 2024-03-04T18:00:00Z)
        #[arg(long)]
        deadline: Option<Time>,
        /// Parent quest ID, repeatable
        #[arg(long = "parent")]
        parents: Vec<QuestId>,
        /// Checkbox subtask as `description` or `description=weight`, repeatable
        #[arg(long = "subtask")]
        subtasks: Vec<String>,
    },
    /// List quests
    List {
        /// Filter by status, repeatable
        #[arg(long)]
        status: Vec<QuestStatus>,
        /// Case-insensitive text search
        #[arg(long)]
        search: Option<String>,
        /// Sort key (created, deadline, title, cost, rarity)
        #[arg(long, default_value = "created")]
        sort: SortKey,
        /// Largest first
        #[arg(long)]
        desc: bool,
    },
    /// Show quest details and progress
    Show {
        /// Quest ID
        id: QuestId,
    },
    /// Complete a quest and credit its reward
    Complete {
        /// Quest ID
        id: QuestId,
    },
    /// Fail a quest
    Fail {
        /// Quest ID
        id: QuestId,
    },
    /// Move a finished or failed quest back to active, or inactive while blocked
    Revert {
        /// Quest ID
        id: QuestId,
    },
    /// Delete a quest
    Delete {
        /// Quest ID
        id: QuestId,
    },
    /// Manage recurring templates
    #[command(subcommand)]
    Template(TemplateCommands),
    /// Run one scheduler sweep now
    Tick,
    /// Run the scheduler until Ctrl-C
    Run,
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Add a recurring template
    Add {
        /// Title of generated quests
        title: String,
        /// Recurrence (daily, weekly, interval)
        #[arg(long)]
        recurrence: String,
        /// Rarity of generated quests
        #[arg(long, default_value = "common")]
        rarity: Rarity,
        /// Reward of generated quests
        #[arg(long, default_value = "0")]
        cost: u32,
        /// Hours from generation to deadline
        #[arg(long, default_value = "24")]
        duration_hours: u32,
        /// Weekday index for weekly templates, Monday = 0, repeatable
        #[arg(long = "weekday")]
        weekdays: Vec<u8>,
        /// Hours between generations for interval templates
        #[arg(long)]
        interval_hours: Option<u32>,
        /// Window start, RFC 3339; its time of day gates daily and weekly runs
        #[arg(long)]
        start_at: Option<Time>,
        /// Window end, RFC 3339
        #[arg(long)]
        end_at: Option<Time>,
    },
    /// List templates
    List {
        /// Only active templates
        #[arg(long)]
        active: bool,
    },
    /// Generate a quest from a template now
    Trigger {
        /// Template ID
        id: TemplateId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.config;
    let owner = UserId::new(config.user.clone());

    let storage = open_storage(&config).await?;
    let service = QuestService::new(storage.clone());

    match cli.command {
        Commands::Add {
            title,
            rarity,
            cost,
            deadline,
            parents,
            subtasks,
        } => {
            let mut spec = QuestSpec::new(title, rarity, cost).with_parents(parents);
            if let Some(deadline) = deadline {
                spec = spec.with_deadline(deadline);
            }
            for raw in &subtasks {
                spec = spec.with_subtask(parse_subtask(raw)?);
            }
            let quest = service.create_quest(&owner, spec, Utc::now()).await?;
            println!("Added quest: {} - {} [{}]", quest.id, quest.title, quest.status);
        }
        Commands::List {
            status,
            search,
            sort,
            desc,
        } => {
            let order = if desc { SortOrder::Desc } else { SortOrder::Asc };
            let mut filter = QuestFilter::default().sorted_by(sort, order);
            if !status.is_empty() {
                filter.status = Some(status);
            }
            if let Some(text) = search {
                filter = filter.search(text);
            }
            let quests = service.list_quests(&owner, &filter).await?;

            println!("Quests ({})", quests.len());
            for quest in quests {
                println!("  {}", format_line(&quest));
            }
        }
        Commands::Show { id } => {
            let quest = service.get_quest(&owner, id).await?;
            let progress = service.get_progress(&owner, id).await?;
            let parents = service.parents_of(&owner, id).await?;
            let children = service.children_of(&owner, id).await?;

            println!("Quest: {}", quest.id);
            println!("  Title: {}", quest.title);
            println!("  Author: {}", quest.author);
            if !quest.description.is_empty() {
                println!("  Description: {}", quest.description);
            }
            println!("  Status: {}", quest.status);
            println!("  Rarity: {}", quest.rarity);
            println!("  Reward: {}", quest.cost);
            if let Some(deadline) = quest.deadline {
                println!("  Deadline: {}", deadline.to_rfc3339());
            }
            if let Some(scope) = &quest.scope {
                println!("  Scope: {}", scope);
            }
            println!("  Progress: {}%", progress.percent);
            println!("  Created: {}", quest.created.to_rfc3339());
            for subtask in &quest.subtasks {
                let state = match subtask.kind {
                    SubtaskKind::Checkbox { completed } => {
                        if completed { "[x]".to_string() } else { "[ ]".to_string() }
                    }
                    SubtaskKind::Numeric { target, current } => format!("{}/{}", current, target),
                };
                println!(
                    "    {} {} (weight {}) {}",
                    state, subtask.description, subtask.weight, subtask.id
                );
            }
            if !parents.is_empty() {
                println!("  Parents: {}", join_ids(&parents));
            }
            if !children.is_empty() {
                println!("  Children: {}", join_ids(&children));
            }
        }
        Commands::Complete { id } => {
            let transition = service.complete_quest(&owner, id).await?;
            print_transition("Completed", &transition);
            if transition.credited > 0 {
                println!("  Balance: {}", service.balance(&owner).await?);
            }
        }
        Commands::Fail { id } => {
            let transition = service.fail_quest(&owner, id).await?;
            print_transition("Failed", &transition);
        }
        Commands::Revert { id } => {
            let transition = service.revert_quest(&owner, id).await?;
            print_transition("Reverted", &transition);
        }
        Commands::Delete { id } => {
            service.delete_quest(&owner, id).await?;
            println!("Deleted quest: {}", id);
        }
        Commands::Template(command) => run_template_command(&service, &owner, command).await?,
        Commands::Tick => {
            let scheduler = Scheduler::new(storage, scheduler_config(&config));
            let report = scheduler.tick(Utc::now()).await;
            println!("Generated: {}", report.generated.len());
            println!("Expired: {}", report.expired.len());
            for failure in &report.failures {
                println!("  failure: {}", failure);
            }
        }
        Commands::Run => {
            let scheduler = Scheduler::new(storage, scheduler_config(&config));
            let handle = scheduler.spawn(CancellationToken::new());

            tokio::signal::ctrl_c()
                .await
                .context("cannot listen for Ctrl-C")?;
            info!("shutdown requested");
            handle.shutdown().await;
        }
    }

    Ok(())
}

async fn run_template_command(
    service: &QuestService,
    owner: &UserId,
    command: TemplateCommands,
) -> Result<()> {
    match command {
        TemplateCommands::Add {
            title,
            recurrence,
            rarity,
            cost,
            duration_hours,
            weekdays,
            interval_hours,
            start_at,
            end_at,
        } => {
            let mut spec = TemplateSpec::new(title, RecurrenceType::from(recurrence));
            spec.rarity = rarity;
            spec.cost = cost;
            spec.duration_hours = duration_hours;
            spec.weekdays = weekdays.into_iter().collect();
            spec.interval_hours = interval_hours;
            spec.start_at = start_at;
            spec.end_at = end_at;

            let template = service.create_template(owner, spec, Utc::now()).await?;
            println!(
                "Added template: {} - {} ({})",
                template.id, template.title, template.recurrence_type
            );
        }
        TemplateCommands::List { active } => {
            let templates = service.list_templates(owner, active).await?;
            println!("Templates ({})", templates.len());
            for template in templates {
                let last = template
                    .last_generated
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {} | {} | {} | last: {} - {}",
                    template.id,
                    template.recurrence_type,
                    if template.is_active { "ACTIVE" } else { "PAUSED" },
                    last,
                    template.title,
                );
            }
        }
        TemplateCommands::Trigger { id } => {
            let quest = service.trigger_generation(owner, id, Utc::now()).await?;
            println!("Generated quest: {} - {}", quest.id, quest.title);
        }
    }
    Ok(())
}

async fn open_storage(config: &AppConfig) -> Result<Arc<dyn Storage>> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("cannot create {}", config.data_dir.display()))?;

    let storage: Arc<dyn Storage> = match config.backend {
        Backend::Json => Arc::new(JsonStorage::new(&config.data_dir).await?),
        Backend::Sqlite => {
            let url = config.database_url.clone().unwrap_or_else(|| {
                format!("sqlite://{}", config.data_dir.join("questline.db").display())
            });
            Arc::new(
                SqliteStorage::new(&url)
                    .await
                    .with_context(|| format!("cannot open {}", url))?,
            )
        }
    };
    Ok(storage)
}

fn scheduler_config(config: &AppConfig) -> SchedulerConfig {
    SchedulerConfig::default().with_poll_interval(Duration::from_secs(config.poll_interval_secs))
}

/// `description` or `description=weight`.
fn parse_subtask(raw: &str) -> Result<SubtaskSpec> {
    match raw.rsplit_once('=') {
        Some((description, weight)) => {
            let weight = weight
                .trim()
                .parse()
                .with_context(|| format!("invalid subtask weight in {:?}", raw))?;
            Ok(SubtaskSpec::checkbox(description.trim(), weight))
        }
        None if raw.trim().is_empty() => bail!("empty subtask description"),
        None => Ok(SubtaskSpec::checkbox(raw.trim(), 1)),
    }
}

fn format_line(quest: &Quest) -> String {
    let deadline = quest
        .deadline
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} | {} | {} | {} | {} - {}",
        quest.id,
        format_status(quest.status),
        quest.rarity,
        quest.cost,
        deadline,
        quest.title,
    )
}

fn format_status(status: QuestStatus) -> &'static str {
    match status {
        QuestStatus::Inactive => "INACTIVE",
        QuestStatus::Active => "ACTIVE",
        QuestStatus::Finished => "FINISHED",
        QuestStatus::Failed => "FAILED",
        QuestStatus::Abstract => "ABSTRACT",
    }
}

fn print_transition(verb: &str, transition: &Transition) {
    if !transition.changed {
        println!(
            "Quest {} already {}",
            transition.quest.id, transition.quest.status
        );
        return;
    }
    println!("{} quest: {} - {}", verb, transition.quest.id, transition.quest.title);
    if transition.credited > 0 {
        println!("  Reward: +{}", transition.credited);
    }
    if !transition.activated.is_empty() {
        println!("  Unblocked: {}", join_ids(&transition.activated));
    }
    if !transition.reblocked.is_empty() {
        println!("  Blocked again: {}", join_ids(&transition.reblocked));
    }
}

fn join_ids(ids: &[QuestId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}
