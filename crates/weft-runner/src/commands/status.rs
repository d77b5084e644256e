use crate::cli::StatusArgs;
use crate::commands::base_settings;
use crate::error::CliError;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets, Attribute, Cell, Color, Table};
use std::path::{Path, PathBuf};
use weft_core::config::Config;
use weft_core::errors::DomainError;
use weft_core::model::{Status, Workflow};
use weft_core::store::{snapshot_path, Repository, Store, WorkflowRepository};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRow {
    pub name: String,
    pub tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub status: Status,
}

pub fn stage_rows<R: Repository + ?Sized>(
    repo: &R,
    workflow: &Workflow,
) -> Result<Vec<StageRow>, CliError> {
    let mut rows = Vec::new();
    for stage in repo.stages_of(workflow.id)? {
        let tasks = repo.tasks_of_stage(stage.id)?;
        rows.push(StageRow {
            tasks: tasks.len(),
            successful: tasks.iter().filter(|t| t.status == Status::Successful).count(),
            failed: tasks.iter().filter(|t| t.status == Status::Failed).count(),
            status: stage.status,
            name: stage.name,
        });
    }
    Ok(rows)
}

fn status_cell(status: Status) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        Status::Successful => cell.fg(Color::Green),
        Status::Failed => cell.fg(Color::Red),
        Status::InProgress => cell.fg(Color::Yellow),
        Status::NoAttempt => cell,
    }
}

pub fn format_stage_table(rows: &[StageRow]) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(
            ["Stage", "Tasks", "Successful", "Failed", "Status"]
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    for row in rows {
        table.add_row(vec![
            Cell::new(&row.name).fg(Color::Yellow),
            Cell::new(row.tasks),
            Cell::new(row.successful),
            Cell::new(row.failed),
            status_cell(row.status),
        ]);
    }
    table.to_string()
}

/// Opens the snapshot of `name` under `store_dir` without creating one.
pub fn load_workflow(store_dir: &Path, name: &str) -> Result<(Store, Workflow), CliError> {
    let path = snapshot_path(store_dir, name);
    if !path.exists() {
        return Err(DomainError::WorkflowNotFound(name.to_string()).into());
    }
    let store = Store::open(&path)?;
    let workflow = store
        .find_workflow(name)?
        .ok_or_else(|| DomainError::WorkflowNotFound(name.to_string()))?;
    Ok((store, workflow))
}

pub fn handle_status(
    args: StatusArgs,
    config: &Config,
    store_dir: Option<&PathBuf>,
) -> Result<(), CliError> {
    let settings = base_settings(config, store_dir)?;
    let (store, workflow) = load_workflow(&settings.store_dir, &args.name)?;

    println!(
        "Workflow '{}' ({}) in {}",
        workflow.name,
        workflow.status,
        workflow.output_dir.display()
    );
    println!("{}", format_stage_table(&stage_rows(&store, &workflow)?));
    Ok(())
}
