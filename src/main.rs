//! # Engage CLI
//!
//! Runs the job worker and exposes the automation and campaign management
//! operations from the command line.
//!
//! Usage:
//!   engage init                                  # Write default config
//!   engage worker                                # Consume send-campaign + send-follow-up
//!   engage automation create --file flow.json    # Save an automation definition
//!   engage automation event order_created '{"storeId":"S1"}'
//!   engage campaign create --file promo.json     # Draft, or scheduled if scheduled_at is set
//!   engage campaign analytics <id>

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engage_campaigns::{
    CampaignScheduler, DeliveryWorker, RecipientFanout, SEND_CAMPAIGN, SEND_FOLLOW_UP,
};
use engage_core::EngageConfig;
use engage_core::traits::{JobHandler, JobQueue};
use engage_core::types::{
    AutomationDefinition, CampaignInput, CampaignPatch, CampaignStatus, DeliveryEvent,
    ExecutionFilter, ExecutionStatus, ListMember, PageRequest, Payload,
};
use engage_db::EngageDb;
use engage_scheduler::{
    ActionRegistry, AutomationPatch, AutomationService, SqliteJobQueue, TriggerRegistry,
    WorkflowExecutor,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "engage",
    version,
    about = "📣 Engage: event-triggered automations and scheduled campaigns"
)]
struct Cli {
    /// Config file (default: ~/.engage/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Database path, overrides the config value
    #[arg(long)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init,
    /// Run queue consumers until Ctrl-C
    Worker,
    /// Manage automations
    Automation {
        #[command(subcommand)]
        action: AutomationCmd,
    },
    /// Manage campaigns
    Campaign {
        #[command(subcommand)]
        action: CampaignCmd,
    },
    /// Manage target lists
    List {
        #[command(subcommand)]
        action: ListCmd,
    },
    /// Apply a provider status callback (delivered, read, opened, clicked, replied, failed)
    DeliveryEvent {
        message_id: String,
        event: String,
        /// Failure reason, for `failed`
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum AutomationCmd {
    /// Create from a JSON definition
    Create {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Replace name/description/nodes/active from a JSON patch
    Update {
        id: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    List,
    Get { id: String },
    Toggle {
        id: String,
        #[arg(long)]
        active: bool,
    },
    Delete { id: String },
    /// Run one automation and wait for the result
    Trigger { id: String, payload: String },
    /// Fan an event out to every matching active automation
    Event { event: String, payload: String },
    /// Dry run against sample data
    Test { id: String, payload: String },
    /// Paginated execution history
    Logs {
        id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum CampaignCmd {
    /// Create from a JSON campaign definition
    Create {
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Apply a JSON patch to a draft or scheduled campaign
    Update {
        id: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    Get { id: String },
    Start { id: String },
    Cancel { id: String },
    Delete { id: String },
    Analytics { id: String },
}

#[derive(Subcommand)]
enum ListCmd {
    /// Add or replace a member; fields as key=value
    AddMember {
        list_id: String,
        recipient_id: String,
        #[arg(long)]
        address: Option<String>,
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    RemoveMember { list_id: String, recipient_id: String },
    Members { list_id: String },
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

/// Everything the commands need, built once from config.
struct App {
    db: Arc<EngageDb>,
    queue: Arc<SqliteJobQueue>,
    automations: AutomationService,
    campaigns: CampaignScheduler,
    worker: Arc<DeliveryWorker>,
}

impl App {
    fn build(config: &EngageConfig, db_path: PathBuf) -> Result<Self> {
        let db = Arc::new(
            EngageDb::open(&db_path)
                .with_context(|| format!("opening database {}", db_path.display()))?,
        );
        let queue = Arc::new(SqliteJobQueue::new(db.clone(), config.queue.clone()));
        let channels = engage_channels::build_channels(config);

        let triggers = Arc::new(TriggerRegistry::with_builtins());
        let actions = Arc::new(ActionRegistry::with_builtins(db.clone(), channels.clone()));
        let executor = Arc::new(WorkflowExecutor::new(db.clone(), triggers, actions));
        let automations = AutomationService::new(db.clone(), executor);

        let campaigns = CampaignScheduler::new(
            db.clone(),
            queue.clone(),
            &config.delivery.default_locale,
        );
        let worker = Arc::new(DeliveryWorker::new(
            db.clone(),
            RecipientFanout::new(db.clone(), db.clone()),
            channels,
            queue.clone(),
            Duration::from_millis(config.delivery.send_interval_ms),
        ));

        Ok(Self {
            db,
            queue,
            automations,
            campaigns,
            worker,
        })
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_payload(raw: &str) -> Result<Payload> {
    serde_json::from_str(raw).context("payload must be JSON")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngageConfig::load_from(&PathBuf::from(shellexpand::tilde(path).to_string()))?,
        None => EngageConfig::load()?,
    };

    let filter = if cli.verbose { "engage=debug" } else { "engage=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    if let Command::Init = cli.command {
        config.save()?;
        println!("✅ Config written to {}", EngageConfig::default_path().display());
        return Ok(());
    }

    let db_path = match &cli.db {
        Some(p) => PathBuf::from(shellexpand::tilde(p).to_string()),
        None => config.database.resolved_path(),
    };
    let app = App::build(&config, db_path)?;

    match cli.command {
        Command::Init => {}
        Command::Worker => run_worker(&app).await?,
        Command::Automation { action } => automation_cmd(&app, action).await?,
        Command::Campaign { action } => campaign_cmd(&app, action).await?,
        Command::List { action } => list_cmd(&app, action)?,
        Command::DeliveryEvent {
            message_id,
            event,
            reason,
        } => {
            let mut raw = serde_json::json!({ "event": event });
            if let Some(reason) = reason {
                raw["reason"] = Payload::String(reason);
            }
            let event: DeliveryEvent =
                serde_json::from_value(raw).context("unknown delivery event")?;
            let applied = app.campaigns.record_delivery_event(&message_id, &event)?;
            println!("{}", if applied { "✅ applied" } else { "⏭️ ignored" });
        }
    }
    Ok(())
}

async fn run_worker(app: &App) -> Result<()> {
    tracing::info!("🚀 Engage worker starting");
    let mut consumers = Vec::new();
    for topic in [SEND_CAMPAIGN, SEND_FOLLOW_UP] {
        let queue = app.queue.clone();
        let handler: Arc<dyn JobHandler> = app.worker.clone();
        consumers.push(tokio::spawn(async move {
            if let Err(e) = queue.consume(topic, handler).await {
                tracing::error!("❌ Consumer '{topic}' stopped: {e}");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down, waiting for in-flight jobs");
    app.queue.shutdown();
    for consumer in consumers {
        consumer.await?;
    }
    Ok(())
}

async fn automation_cmd(app: &App, action: AutomationCmd) -> Result<()> {
    let svc = &app.automations;
    match action {
        AutomationCmd::Create { file } => {
            let def: AutomationDefinition = read_json(&file)?;
            print_json(&svc.create(def).await?)?;
        }
        AutomationCmd::Update { id, file } => {
            let patch: AutomationPatch = read_json(&file)?;
            print_json(&svc.update(&id, patch).await?)?;
        }
        AutomationCmd::List => {
            for def in svc.list().await? {
                println!(
                    "{}  {:<30} {:<8} runs={}",
                    def.id,
                    def.name,
                    if def.active { "active" } else { "paused" },
                    def.execution_count
                );
            }
        }
        AutomationCmd::Get { id } => print_json(&svc.get(&id).await?)?,
        AutomationCmd::Toggle { id, active } => print_json(&svc.toggle(&id, active).await?)?,
        AutomationCmd::Delete { id } => {
            svc.delete(&id).await?;
            println!("🗑️ Automation {id} deleted");
        }
        AutomationCmd::Trigger { id, payload } => {
            print_json(&svc.trigger(&id, parse_payload(&payload)?).await?)?;
        }
        AutomationCmd::Event { event, payload } => {
            let started = svc.trigger_by_event(&event, parse_payload(&payload)?).await?;
            println!("🚀 {} automation(s) triggered", started.len());
            for run in started {
                if let Some(report) = run.task.await? {
                    println!("  {} → {}", run.name, report.status.as_str());
                }
            }
        }
        AutomationCmd::Test { id, payload } => {
            print_json(&svc.test_automation(&id, parse_payload(&payload)?).await?)?;
        }
        AutomationCmd::Logs {
            id,
            status,
            page,
            limit,
        } => {
            let filter = ExecutionFilter {
                status: status.map(|s| s.parse::<ExecutionStatus>()).transpose()?,
                ..Default::default()
            };
            print_json(&svc.execution_logs(&id, &filter, PageRequest::new(page, limit)).await?)?;
        }
    }
    Ok(())
}

async fn campaign_cmd(app: &App, action: CampaignCmd) -> Result<()> {
    let svc = &app.campaigns;
    match action {
        CampaignCmd::Create { file } => {
            let input: CampaignInput = read_json(&file)?;
            print_json(&svc.create(input).await?)?;
        }
        CampaignCmd::Update { id, file } => {
            let patch: CampaignPatch = read_json(&file)?;
            print_json(&svc.update(&id, patch).await?)?;
        }
        CampaignCmd::List {
            status,
            page,
            limit,
        } => {
            let status = status.map(|s| s.parse::<CampaignStatus>()).transpose()?;
            let listed = svc.list(status, PageRequest::new(page, limit))?;
            for c in &listed.items {
                println!("{}  {:<30} {}", c.id, c.name, c.status);
            }
            println!(
                "page {}/{} ({} total)",
                listed.pagination.page, listed.pagination.total_pages, listed.pagination.total
            );
        }
        CampaignCmd::Get { id } => print_json(&svc.get(&id)?)?,
        CampaignCmd::Start { id } => print_json(&svc.start(&id).await?)?,
        CampaignCmd::Cancel { id } => print_json(&svc.cancel(&id).await?)?,
        CampaignCmd::Delete { id } => {
            svc.delete(&id)?;
            println!("🗑️ Campaign {id} deleted");
        }
        CampaignCmd::Analytics { id } => print_json(&svc.analytics(&id)?)?,
    }
    Ok(())
}

fn list_cmd(app: &App, action: ListCmd) -> Result<()> {
    match action {
        ListCmd::AddMember {
            list_id,
            recipient_id,
            address,
            fields,
        } => {
            let member = ListMember {
                recipient_id,
                address,
                fields: fields.into_iter().collect(),
            };
            app.db.add_list_member(&list_id, &member)?;
            println!("✅ {} added to {list_id}", member.recipient_id);
        }
        ListCmd::RemoveMember {
            list_id,
            recipient_id,
        } => {
            let removed = app.db.remove_list_member(&list_id, &recipient_id)?;
            println!("{}", if removed { "🗑️ removed" } else { "not a member" });
        }
        ListCmd::Members { list_id } => print_json(&app.db.list_members(&list_id)?)?,
    }
    Ok(())
}
