use crate::cli::RunArgs;
use crate::commands::base_settings;
use crate::commands::status::{format_stage_table, stage_rows};
use crate::error::{CliError, EngineError};
use crate::scheduler::{EngineEvent, Scheduler};
use crate::session::{discard_outputs, start_workflow, StartMode};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use weft_core::config::{Config, Drm, Settings};
use weft_core::errors::ConfigError;
use weft_core::materialize::materialize;
use weft_core::model::Status;
use weft_core::pipeline::load_pipeline;
use weft_core::resolver::resolve;
use weft_core::store::{snapshot_path, Store, WorkflowRepository};
use weft_executor::job_manager_for;

fn run_settings(
    args: &RunArgs,
    config: &Config,
    store_dir: Option<&PathBuf>,
) -> Result<Settings, CliError> {
    let mut settings = base_settings(config, store_dir)?;
    if let Some(n) = args.max_cores {
        settings.max_cores = n;
    }
    if let Some(n) = args.max_reattempts {
        settings.max_reattempts = n;
    }
    if let Some(queue) = &args.default_queue {
        settings.default_queue = Some(queue.clone());
    }
    if let Some(drm) = &args.drm {
        settings.drm = drm.parse::<Drm>()?;
    }
    if let Some(root) = &args.output_root {
        settings.output_root = root.clone();
    }
    settings.dry_run = args.dry_run;
    settings.delete_intermediates = args.delete_intermediates;
    settings.terminate_on_failure = !args.continue_on_failure;
    Ok(settings)
}

fn workflow_name(args: &RunArgs) -> Result<String, CliError> {
    if let Some(name) = &args.name {
        return Ok(name.clone());
    }
    args.pipeline
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| {
            CliError::Config(ConfigError::General(format!(
                "Cannot derive a workflow name from '{}'; pass --name.",
                args.pipeline.display()
            )))
        })
}

fn start_mode(args: &RunArgs) -> StartMode {
    if args.restart {
        StartMode::Restart
    } else if args.reload {
        StartMode::Reload
    } else {
        StartMode::Resume
    }
}

fn print_events(rx: mpsc::Receiver<EngineEvent>) {
    for event in rx {
        match event {
            EngineEvent::Started { pending, reused } => {
                println!(
                    "- Scheduling {} task(s), {} already successful...",
                    pending.to_string().bold(),
                    reused
                );
            }
            EngineEvent::TaskSubmitted {
                stage,
                tags,
                job_id,
                current,
                total,
                ..
            } => {
                println!(
                    "  {} [{}/{}] {} {} (job {})",
                    ">>".cyan(),
                    current,
                    total,
                    stage,
                    tags.to_string().dimmed(),
                    job_id.as_deref().unwrap_or("?")
                );
            }
            EngineEvent::TaskSucceeded { stage, tags, .. } => {
                println!("  {} {} {}", "OK".green().bold(), stage, tags.to_string().dimmed());
            }
            EngineEvent::TaskRetrying {
                stage,
                tags,
                failed_attempts,
                ..
            } => {
                println!(
                    "  {} {} {} (failed {} time(s))",
                    "RETRY".yellow().bold(),
                    stage,
                    tags.to_string().dimmed(),
                    failed_attempts
                );
            }
            EngineEvent::TaskFailed { stage, tags, .. } => {
                println!("  {} {} {}", "FAIL".red().bold(), stage, tags.to_string().dimmed());
            }
            EngineEvent::TaskBlocked { task, blocked_by } => {
                tracing::debug!("{} blocked by failed {}", task, blocked_by);
            }
            EngineEvent::StageFinished { stage, status } => {
                let status = match status {
                    Status::Successful => status.to_string().green(),
                    Status::Failed => status.to_string().red(),
                    _ => status.to_string().normal(),
                };
                println!("- Stage '{}' {}", stage.cyan(), status);
            }
            EngineEvent::DryRun {
                stage,
                tags,
                command,
            } => {
                println!("  {} {} {}", "DRY".cyan().bold(), stage, tags.to_string().dimmed());
                for line in command.lines() {
                    println!("      {}", line);
                }
            }
        }
    }
}

pub fn handle_run(
    args: RunArgs,
    config: &Config,
    store_dir: Option<&PathBuf>,
) -> Result<(), CliError> {
    let settings = run_settings(&args, config, store_dir)?;
    let name = workflow_name(&args)?;

    println!("- Loading pipeline '{}'...", args.pipeline.display());
    let spec = load_pipeline(&args.pipeline)?;
    let graph = resolve(&spec)?;

    let store_path = snapshot_path(&settings.store_dir, &name);
    tracing::info!("Using store {}", store_path.display());
    let mut store = Store::open(&store_path)?;
    if settings.dry_run {
        store.detach();
    }

    let session = start_workflow(&mut store, &settings, &name, start_mode(&args))?;
    if !session.created {
        println!(
            "- Workflow '{}' exists: {} task(s) purged ({:?})",
            name.cyan(),
            session.purged_tasks,
            start_mode(&args)
        );
    }
    let materialized = materialize(&mut store, &session.workflow, &spec, &graph)?;
    if !settings.dry_run {
        discard_outputs(&materialized.invalidated);
    }
    println!(
        "- Resolved {} task(s): {} new, {} reused",
        materialized.task_of_node.len(),
        materialized.created,
        materialized.reused
    );

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        tracing::warn!("Failed to install interrupt handler: {}", e);
    }

    let workflow_id = session.workflow.id;
    let mut jobs = job_manager_for(&settings)?;
    let (tx, rx) = mpsc::channel();
    let result = thread::scope(|s| {
        s.spawn(move || print_events(rx));
        Scheduler::new(&mut store, jobs.as_mut(), &settings, session.workflow)
            .map(|scheduler| scheduler.with_interrupt(interrupt).with_events(tx))
            .and_then(Scheduler::run)
    });

    let workflow = store.workflow(workflow_id)?;
    println!("{}", format_stage_table(&stage_rows(&store, &workflow)?));

    let report = result?;
    if settings.dry_run {
        println!(
            "{}",
            format!("Dry run: {} task(s) would be submitted.", report.planned).cyan()
        );
        return Ok(());
    }
    if !report.is_success() {
        return Err(EngineError::TasksFailed {
            failed: report.failed,
            blocked: report.blocked,
        }
        .into());
    }
    println!(
        "{}",
        format!(
            "Workflow '{}' completed: {} task(s) run, {} reused.",
            name, report.succeeded, report.reused
        )
        .green()
    );
    Ok(())
}
