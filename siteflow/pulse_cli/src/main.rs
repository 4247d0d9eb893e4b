use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use shared_event_bus::{EventRecord, EventSubscriber, MemoryEventBus};
use staff_pulse::{
    evaluate,
    flags::FlagRecord,
    store::{ActivityEntry, HistoryEntry, Notification},
    task::UserId,
    ActorContext, FlagAssessment, FlagRules, FleetMonitor, LifecycleController, MemoryBackend,
    NewTask, PulseConfig, ResyncSummary, StaffMember, StaffRole, Task, TaskOutcome,
};
use tokio::{
    runtime::Runtime,
    sync::broadcast::{self, error::TryRecvError},
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEMO_CONTEXT: &str = "lead-101";

#[derive(Parser, Debug)]
#[command(name = "pulse", version, about = "Staff task lifecycle and performance flags")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluates the flag for a JSON array of tasks.
    Evaluate {
        /// File holding the tasks of one assignee.
        #[arg(long)]
        tasks: PathBuf,
        /// Evaluation instant (RFC 3339); defaults to now.
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        /// Engine config (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validates a config file and prints the effective settings.
    CheckConfig {
        /// Config file to check.
        path: PathBuf,
    },
    /// Runs a fleet against in-memory collaborators and walks one task
    /// through its lifecycle.
    Demo {
        /// Engine config (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct EvaluationReport {
    now: DateTime<Utc>,
    tasks: usize,
    assessment: FlagAssessment,
}

#[derive(Debug, Serialize)]
struct UserFlag {
    user_id: UserId,
    name: String,
    role: String,
    flag: Option<FlagRecord>,
}

#[derive(Debug, Serialize)]
struct DemoStep {
    action: &'static str,
    outcome: TaskOutcome,
}

#[derive(Debug, Serialize)]
struct DemoReport {
    now: DateTime<Utc>,
    steps: Vec<DemoStep>,
    flags: Vec<UserFlag>,
    notifications: Vec<Notification>,
    history: Vec<HistoryEntry>,
    activity: Vec<ActivityEntry>,
    resync: ResyncSummary,
    events: BTreeMap<String, usize>,
    stopped: Vec<UserId>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    match cli.command {
        Commands::Evaluate { tasks, now, config } => {
            let config = load_config(config.as_deref())?;
            let report = evaluate_file(&tasks, now.unwrap_or_else(Utc::now), &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::CheckConfig { path } => {
            let config = PulseConfig::load(&path)?;
            config.flag_rules()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo { config } => {
            let config = load_config(config.as_deref())?;
            let runtime = Runtime::new().context("starting tokio runtime")?;
            let report = runtime.block_on(run_demo(&config))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<PulseConfig> {
    path.map_or_else(|| Ok(PulseConfig::default()), PulseConfig::load)
}

fn evaluate_file(
    path: &Path,
    now: DateTime<Utc>,
    config: &PulseConfig,
) -> Result<EvaluationReport> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading tasks from {}", path.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing tasks in {}", path.display()))?;
    let rules = config.flag_rules()?;
    Ok(EvaluationReport {
        now,
        tasks: tasks.len(),
        assessment: evaluate(&tasks, now, &rules),
    })
}

/// 10:00 business time today, plus the business date.
fn business_morning(rules: &FlagRules) -> Result<(DateTime<Utc>, NaiveDate)> {
    let today = Utc::now().with_timezone(&rules.utc_offset).date_naive();
    let local = today
        .and_hms_opt(10, 0, 0)
        .context("invalid demo start time")?
        .and_local_timezone(rules.utc_offset)
        .single()
        .context("ambiguous demo start time")?;
    Ok((local.with_timezone(&Utc), today))
}

async fn wait_until(mut ready: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !ready() {
        if tokio::time::Instant::now() >= deadline {
            bail!("monitors did not settle in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Counts the events already delivered to `feed`, by topic.
fn tally_topics(feed: &mut broadcast::Receiver<EventRecord>) -> BTreeMap<String, usize> {
    let mut topics = BTreeMap::new();
    loop {
        match feed.try_recv() {
            Ok(event) => *topics.entry(event.topic).or_insert(0) += 1,
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "demo event feed lagged");
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    topics
}

async fn run_demo(config: &PulseConfig) -> Result<DemoReport> {
    let rules = config.flag_rules()?;
    let (now, today) = business_morning(&rules)?;
    let backend = MemoryBackend::with_feed_capacity(now, config.monitor.feed_capacity);

    let bus = Arc::new(MemoryEventBus::new(512));
    let mut event_feed = bus.subscribe().await?;
    let mut telemetry = config.telemetry_builder()?;
    if config.telemetry.event_log.is_none() {
        telemetry = telemetry.event_publisher(bus.clone());
    }
    let telemetry = telemetry.build()?;

    let roster = [
        StaffMember::new("asha", "Asha", StaffRole::Admin),
        StaffMember::new("meera", "Meera", StaffRole::Manager),
        StaffMember::new("ravi", "Ravi", StaffRole::Staff),
        StaffMember::new("kiran", "Kiran", StaffRole::Staff),
    ];
    for member in &roster {
        backend.directory.upsert(member.clone());
    }

    let collaborators = backend.collaborators();
    let fleet = FleetMonitor::builder(collaborators.clone())
        .rules(rules)
        .resync_interval(config.resync_interval())
        .telemetry(telemetry.clone())
        .build()
        .start_all()
        .await?;
    let controller = LifecycleController::builder(collaborators)
        .rules(rules)
        .policy(config.effect_policy())
        .telemetry(telemetry)
        .build();
    info!(staff = roster.len(), %now, "demo fleet running");

    let meera = ActorContext::new("meera", "Meera", StaffRole::Manager);
    let ravi = ActorContext::new("ravi", "Ravi", StaffRole::Staff);
    let mut steps = Vec::new();

    let survey = controller
        .create(
            NewTask::new("ravi", "Site survey", today)
                .due(now + chrono::Duration::minutes(30))
                .requested_by("asha")
                .in_context(DEMO_CONTEXT, "lead")
                .described("Measure the north plot"),
            &meera,
        )
        .await?;
    let survey_id = survey.task.id;
    steps.push(DemoStep { action: "create", outcome: survey });

    let permit = controller
        .create(
            NewTask::new("kiran", "Submit permit", today).due(now - chrono::Duration::hours(1)),
            &meera,
        )
        .await?;
    steps.push(DemoStep { action: "create", outcome: permit });

    let started = controller.start(survey_id, &ravi).await?;
    steps.push(DemoStep { action: "start", outcome: started });
    let completed = controller.complete(survey_id, &ravi).await?;
    steps.push(DemoStep { action: "complete", outcome: completed });
    let acknowledged = controller.acknowledge(survey_id, &meera).await?;
    steps.push(DemoStep { action: "acknowledge", outcome: acknowledged });

    let oversight = roster.iter().filter(|m| m.role.is_oversight()).count();
    wait_until(|| {
        backend
            .notifications
            .sent()
            .iter()
            .filter(|n| n.title == staff_pulse::escalation::ALERT_TITLE)
            .count()
            >= oversight
    })
    .await?;

    let resync = fleet.resync_now().await?;
    let stopped = fleet.stop_all().await;

    let flags = roster
        .iter()
        .map(|member| UserFlag {
            user_id: member.id.clone(),
            name: member.name.clone(),
            role: member.role.to_string(),
            flag: backend.directory.flag(&member.id),
        })
        .collect();
    let events = tally_topics(&mut event_feed);

    Ok(DemoReport {
        now,
        steps,
        flags,
        notifications: backend.notifications.sent(),
        history: backend.contexts.entries(DEMO_CONTEXT),
        activity: backend.activity.entries(),
        resync,
        events,
        stopped,
    })
}
