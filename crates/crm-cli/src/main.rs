//! CLI binary for lifecycle evaluation and record sync between JSON-file
//! backed systems.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crm_lifecycle::{default_registry, LogNotifier, StageTable};
use crm_service::{CrmService, Settings, SubmitSyncJob};
use crm_sync::{
    AdapterRegistry, FieldMapping, FileJobStore, JobStore, MemoryAdapter, MemoryConflictStore,
    MemoryJobStore, Snapshot, SyncOrchestrator,
};
use crm_types::{ContactRecord, ObjectType, Record};

#[derive(Parser)]
#[command(name = "crm", version, about = "CRM lifecycle automation and record sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON settings file (default: CRM_* environment variables)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate contacts against the lifecycle stage rules
    Evaluate {
        /// JSON file holding one contact or a list of contacts
        #[arg(long)]
        contact: PathBuf,

        /// JSON stage table replacing the stock one
        #[arg(long)]
        stages: Option<PathBuf>,
    },

    /// Sync records from one JSON snapshot into another
    Sync {
        /// Source snapshot (object type -> records)
        #[arg(long)]
        source: PathBuf,

        /// Target snapshot (object type -> records)
        #[arg(long)]
        target: PathBuf,

        /// Object types to sync
        #[arg(long, value_delimiter = ',', default_value = "contact")]
        objects: Vec<String>,

        /// JSON field mapping: object type -> {source field: target field}
        #[arg(long)]
        mapping: PathBuf,

        /// Conflict strategy: source_wins, target_wins, newest_wins, manual
        #[arg(long)]
        strategy: Option<String>,

        /// Source system id (default: source file stem)
        #[arg(long)]
        source_system: Option<String>,

        /// Target system id (default: target file stem)
        #[arg(long)]
        target_system: Option<String>,

        /// Persist jobs here so interrupted syncs can be resumed
        #[arg(long)]
        jobs_dir: Option<PathBuf>,

        /// Resume this job instead of submitting a new one (needs --jobs-dir)
        #[arg(long, requires = "jobs_dir")]
        resume: Option<uuid::Uuid>,

        /// Fail records whose fields are not all mapped
        #[arg(long)]
        strict: bool,

        /// Override the configured batch size
        #[arg(long)]
        batch_size: Option<usize>,

        /// Write the updated target snapshot back to its file
        #[arg(long)]
        write_back: bool,
    },

    /// List persisted sync jobs
    Jobs {
        #[arg(long)]
        jobs_dir: PathBuf,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the lifecycle stage table
    Stages {
        /// JSON stage table replacing the stock one
        #[arg(long)]
        stages: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings(cli.settings.as_deref()).await?;

    match cli.command {
        Commands::Evaluate { contact, stages } => {
            cmd_evaluate(settings, &contact, stages.as_deref()).await?;
        }
        Commands::Sync {
            source,
            target,
            objects,
            mapping,
            strategy,
            source_system,
            target_system,
            jobs_dir,
            resume,
            strict,
            batch_size,
            write_back,
        } => {
            let mut settings = settings;
            if let Some(n) = batch_size {
                settings.sync_batch_size = n;
            }
            let args = SyncArgs {
                source,
                target,
                objects,
                mapping,
                strategy,
                source_system,
                target_system,
                jobs_dir,
                resume,
                strict,
                write_back,
            };
            cmd_sync(settings, args).await?;
        }
        Commands::Jobs { jobs_dir, limit } => {
            cmd_jobs(&jobs_dir, limit).await?;
        }
        Commands::Stages { stages } => {
            cmd_stages(settings, stages.as_deref()).await?;
        }
    }

    Ok(())
}

async fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(p) => Settings::load(p)
            .await
            .with_context(|| format!("reading settings from {}", p.display()))?,
        None => Settings::from_env(),
    };
    settings.validate()?;
    Ok(settings)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Contacts file: a single contact or a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum Contacts {
    One(ContactRecord),
    Many(Vec<ContactRecord>),
}

impl Contacts {
    fn into_vec(self) -> Vec<ContactRecord> {
        match self {
            Contacts::One(c) => vec![c],
            Contacts::Many(cs) => cs,
        }
    }
}

/// Service for lifecycle commands: no sync systems, actions against a
/// local in-memory CRM seeded with the contacts.
async fn lifecycle_service(
    settings: Settings,
    stages: Option<&Path>,
    contacts: &[ContactRecord],
) -> anyhow::Result<CrmService> {
    let local = Arc::new(MemoryAdapter::new("local"));
    for contact in contacts {
        local.seed(
            ObjectType::Contact,
            Record {
                id: contact.id.clone(),
                fields: contact.fields.clone(),
                modified_at: None,
            },
        );
    }
    let service = CrmService::in_memory(
        settings,
        AdapterRegistry::new(),
        default_registry(local, Arc::new(LogNotifier)),
    )?;
    if let Some(path) = stages {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        service.reconfigure_stages(StageTable::from_json(&raw)?);
    }
    Ok(service)
}

async fn cmd_evaluate(
    settings: Settings,
    contact_path: &Path,
    stages: Option<&Path>,
) -> anyhow::Result<()> {
    let contacts = read_json::<Contacts>(contact_path).await?.into_vec();
    let service = lifecycle_service(settings, stages, &contacts).await?;

    let mut evaluations = Vec::with_capacity(contacts.len());
    for contact in &contacts {
        evaluations.push(service.evaluate_lifecycle(contact).await);
    }
    println!("{}", serde_json::to_string_pretty(&evaluations)?);
    Ok(())
}

async fn cmd_stages(settings: Settings, stages: Option<&Path>) -> anyhow::Result<()> {
    let service = lifecycle_service(settings, stages, &[]).await?;
    for stage in service.list_stages() {
        let next = stage
            .next_stage
            .map_or_else(|| "(terminal)".to_string(), |s| s.to_string());
        println!("{}. {} -> {}", stage.order, stage.name, next);
        if !stage.configured {
            continue;
        }
        for condition in &stage.conditions {
            println!("     when {condition}");
        }
        for action in &stage.actions {
            println!("     then {}", action.kind());
        }
    }
    Ok(())
}

struct SyncArgs {
    source: PathBuf,
    target: PathBuf,
    objects: Vec<String>,
    mapping: PathBuf,
    strategy: Option<String>,
    source_system: Option<String>,
    target_system: Option<String>,
    jobs_dir: Option<PathBuf>,
    resume: Option<uuid::Uuid>,
    strict: bool,
    write_back: bool,
}

/// System id for a snapshot file: explicit, else the file stem.
fn system_id(explicit: Option<String>, path: &Path) -> String {
    explicit.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "system".to_string())
    })
}

async fn cmd_sync(settings: Settings, args: SyncArgs) -> anyhow::Result<()> {
    let source_id = system_id(args.source_system, &args.source);
    let target_id = system_id(args.target_system, &args.target);
    if source_id == target_id {
        anyhow::bail!("source and target resolve to the same system id '{source_id}'; pass --source-system/--target-system");
    }

    let source_snapshot: Snapshot = read_json(&args.source).await?;
    let target_snapshot: Snapshot = read_json(&args.target).await?;
    let mapping: BTreeMap<String, FieldMapping> = read_json(&args.mapping).await?;
    tracing::debug!(
        source = %source_id,
        target = %target_id,
        source_records = source_snapshot.values().map(Vec::len).sum::<usize>(),
        "Snapshots loaded"
    );

    let source = Arc::new(MemoryAdapter::from_snapshot(&source_id, source_snapshot));
    let target = Arc::new(MemoryAdapter::from_snapshot(&target_id, target_snapshot));
    let jobs: Arc<dyn JobStore> = match &args.jobs_dir {
        Some(dir) => Arc::new(FileJobStore::new(dir)),
        None => Arc::new(MemoryJobStore::new()),
    };
    let orchestrator = SyncOrchestrator::new(
        AdapterRegistry::new().with(source).with(target.clone()),
        jobs,
        Arc::new(MemoryConflictStore::new()),
        settings.sync_config(),
    )?;
    let service = CrmService::new(settings, orchestrator, crm_lifecycle::ActionRegistry::new())?;

    let started = match args.resume {
        Some(id) => service.resume_job(id).await?,
        None => {
            let mut request = SubmitSyncJob::new(&source_id, &target_id, args.objects);
            request.field_mapping = mapping;
            request.conflict_resolution = args.strategy;
            request.strict = args.strict;
            service.submit_sync_job(request).await?
        }
    };
    println!(
        "Sync {}: {} -> {} ({})",
        started.sync_id, started.source, started.target, started.conflict_resolution
    );

    let job = tokio::select! {
        done = service.wait_for_job(started.sync_id) => done?,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted, stopping at the next batch boundary...");
            service.cancel_job(started.sync_id).await?;
            service.wait_for_job(started.sync_id).await?
        }
    };

    println!("Status: {}", job.status);
    println!(
        "Records: {} synced ({} created, {} updated), {} errors",
        job.records_synced, job.records_created, job.records_updated, job.errors
    );
    for (object_type, cursor) in &job.cursors {
        println!(
            "  {object_type}: offset {} after {} batches{}",
            cursor.offset,
            cursor.batches,
            if cursor.done { "" } else { " (incomplete)" }
        );
    }
    if let Some(reason) = &job.failure_reason {
        println!("Failure: {reason}");
    }

    let conflicts = service.list_unresolved_conflicts(50).await?;
    if !conflicts.is_empty() {
        println!("\nUnresolved conflicts:");
        for c in &conflicts {
            println!(
                "  [{}] {} {} field '{}': source={} target={}",
                c.id, c.object_type, c.record_key, c.field, c.source_value, c.target_value
            );
        }
    }

    if args.write_back {
        let json = serde_json::to_string_pretty(&target.snapshot())?;
        tokio::fs::write(&args.target, json)
            .await
            .with_context(|| format!("writing {}", args.target.display()))?;
        println!("Wrote {}", args.target.display());
    }
    if args.jobs_dir.is_some() && !job.status.is_terminal() {
        println!("Resume with: crm sync ... --resume {}", job.sync_id);
    }
    Ok(())
}

async fn cmd_jobs(dir: &Path, limit: usize) -> anyhow::Result<()> {
    let jobs = FileJobStore::new(dir).list().await?;
    if jobs.is_empty() {
        println!("No jobs in {}", dir.display());
        return Ok(());
    }
    for job in jobs.iter().take(limit) {
        println!(
            "{}  {:<9}  {} -> {}  synced={} errors={} conflicts={}  started {}",
            job.id,
            job.status.to_string(),
            job.spec.source,
            job.spec.target,
            job.records_synced,
            job.errors,
            job.conflicts_detected,
            job.started_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}
