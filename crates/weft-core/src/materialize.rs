//! Turns a [`ResolvedGraph`] into stored tasks.
//!
//! Instances that match a successful task of the same stage and tag set are
//! reused as-is, unless one of their ancestors had to be recreated in this
//! pass. Everything else is inserted stage by stage with one
//! [`TaskBatch`] per stage.

use crate::errors::{DomainError, StoreError, TemplateError};
use crate::model::{infer_format, Stage, StageId, Status, TagSet, Task, TaskFile, TaskId, Workflow};
use crate::resolver::{PipelineSpec, ResolvedGraph, StageKind, StageSpec, ToolInstance};
use crate::store::{NewTask, NewTaskFile, Repository, TaskBatch};
use crate::template;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct Materialized {
    /// In visiting order.
    pub stages: Vec<Stage>,
    /// Task id per node of the resolved graph.
    pub task_of_node: Vec<TaskId>,
    pub created: usize,
    pub reused: usize,
    /// Stored tasks deleted because their inputs changed or they never
    /// succeeded. Their output directories are stale.
    pub invalidated: Vec<Task>,
}

/// Keyword slots available to a command: one per tag, `in.<name>` and `in`
/// for input paths, and `out_dir`.
pub fn command_vars(
    tags: &TagSet,
    inputs: &[TaskFile],
    output_dir: &Path,
) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<String, String> = tags
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut by_name: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for file in inputs {
        by_name
            .entry(format!("in.{}", file.name))
            .or_default()
            .push(file.path.to_string_lossy().to_string());
    }
    let all: Vec<String> = inputs
        .iter()
        .map(|f| f.path.to_string_lossy().to_string())
        .collect();
    vars.extend(by_name.into_iter().map(|(k, v)| (k, v.join(" "))));
    vars.insert("in".to_string(), all.join(" "));
    vars.insert(
        "out_dir".to_string(),
        output_dir.to_string_lossy().to_string(),
    );
    vars
}

fn task_output_dir(workflow: &Workflow, stage: &StageSpec, node: &ToolInstance) -> PathBuf {
    workflow
        .output_dir
        .join(&stage.name)
        .join(node.tags.slug())
}

fn build_task<R: Repository + ?Sized>(
    repo: &R,
    workflow: &Workflow,
    stage_id: StageId,
    spec: &StageSpec,
    position_in_stage: usize,
    node: &ToolInstance,
    parents: Vec<TaskId>,
) -> Result<NewTask, StoreError> {
    let output_dir = task_output_dir(workflow, spec, node);

    match &spec.kind {
        StageKind::Source(tasks) => {
            let files = tasks
                .get(position_in_stage)
                .map(|t| t.files.as_slice())
                .unwrap_or_default();
            Ok(NewTask {
                stage_id,
                tags: node.tags.clone(),
                command: String::new(),
                resources: Default::default(),
                noop: true,
                succeed_on_failure: false,
                output_dir,
                outputs: files
                    .iter()
                    .map(|f| NewTaskFile {
                        name: f.name.clone(),
                        format: f.format.clone().unwrap_or_else(|| infer_format(&f.path)),
                        path: f.path.clone(),
                        persist: true,
                    })
                    .collect(),
                input_files: Vec::new(),
                parents,
            })
        }
        StageKind::Tool { tool, .. } => {
            let mut inputs: Vec<TaskFile> = Vec::new();
            for &parent in &parents {
                let parent_task = repo.task(parent)?;
                inputs.extend(repo.task_files(&parent_task.output_files)?);
            }
            let vars = command_vars(&node.tags, &inputs, &output_dir);

            let mut outputs = Vec::with_capacity(tool.outputs.len());
            let mut output_paths: BTreeMap<String, String> = BTreeMap::new();
            for out in &tool.outputs {
                let rendered = template::render(&out.path, &vars).map_err(DomainError::from)?;
                let path = if Path::new(&rendered).is_absolute() {
                    PathBuf::from(rendered)
                } else {
                    output_dir.join(rendered)
                };
                output_paths.insert(out.name.clone(), path.to_string_lossy().to_string());
                outputs.push(NewTaskFile {
                    name: out.name.clone(),
                    format: out.format.clone().unwrap_or_else(|| infer_format(&path)),
                    path,
                    persist: out.persist,
                });
            }

            let command = template::render(&tool.command, &vars).map_err(DomainError::from)?;
            let missing: Vec<String> = template::output_markers(&command)
                .into_iter()
                .filter(|name| !output_paths.contains_key(name))
                .collect();
            if !missing.is_empty() {
                return Err(DomainError::from(TemplateError::MissingOutputs {
                    template: command,
                    missing,
                    available: output_paths,
                })
                .into());
            }

            Ok(NewTask {
                stage_id,
                tags: node.tags.clone(),
                command,
                resources: tool.resources,
                noop: tool.noop,
                succeed_on_failure: tool.succeed_on_failure,
                output_dir,
                outputs,
                input_files: inputs.iter().map(|f| f.id).collect(),
                parents,
            })
        }
    }
}

/// Stores `graph` for `workflow`, reusing successful history, and commits.
pub fn materialize<R: Repository + ?Sized>(
    repo: &mut R,
    workflow: &Workflow,
    spec: &PipelineSpec,
    graph: &ResolvedGraph,
) -> Result<Materialized, StoreError> {
    let mut task_of_node: Vec<Option<TaskId>> = vec![None; graph.nodes.len()];
    let mut fresh = vec![false; graph.nodes.len()];
    let mut result = Materialized::default();

    for (order, &stage_idx) in graph.stage_order.iter().enumerate() {
        let stage_spec = &spec.stages[stage_idx];
        let mut stage = repo.get_or_create_stage(workflow.id, &stage_spec.name, order as u32)?;

        let mut batch = TaskBatch::new();
        let mut pending: Vec<usize> = Vec::new();

        for (position, &node_idx) in graph.by_stage[stage_idx].iter().enumerate() {
            let node = &graph.nodes[node_idx];
            let mut parents: Vec<TaskId> = node
                .parents
                .iter()
                .filter_map(|&p| task_of_node[p])
                .collect();
            let ancestor_recreated = node.parents.iter().any(|&p| fresh[p]);

            if let Some(existing) = repo.find_task_by_tags(stage.id, &node.tags)? {
                let mut stored_parents = repo.parents_of(existing.id)?;
                stored_parents.sort();
                let mut wanted = parents.clone();
                wanted.sort();

                if existing.status == Status::Successful
                    && !ancestor_recreated
                    && stored_parents == wanted
                {
                    task_of_node[node_idx] = Some(existing.id);
                    result.reused += 1;
                    continue;
                }
                tracing::debug!(
                    "Invalidating {} in stage '{}' {} (status {})",
                    existing.id,
                    stage.name,
                    existing.tags,
                    existing.status
                );
                result
                    .invalidated
                    .extend(repo.delete_tasks(&[existing.id])?);
            }

            parents.dedup();
            batch.push(build_task(
                &*repo,
                workflow,
                stage.id,
                stage_spec,
                position,
                node,
                parents,
            )?);
            pending.push(node_idx);
        }

        if !batch.is_empty() {
            let count = batch.len();
            let inserted = repo.insert_tasks(batch)?;
            for (node_idx, task) in pending.into_iter().zip(inserted) {
                task_of_node[node_idx] = Some(task.id);
                fresh[node_idx] = true;
            }
            result.created += count;

            stage.status = Status::NoAttempt;
            stage.finished_on = None;
            repo.update_stage(&stage)?;
            tracing::info!("Stage '{}': created {} task(s)", stage.name, count);
        }

        result.stages.push(stage);
    }

    result.task_of_node = task_of_node.into_iter().flatten().collect();
    repo.commit()?;

    tracing::info!(
        "Materialized {} task(s): {} new, {} reused, {} invalidated",
        graph.nodes.len(),
        result.created,
        result.reused,
        result.invalidated.len()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resources;
    use crate::resolver::{
        resolve, OutputSpec, ShardStrategy, SourceFile, SourceTask, ToolSpec,
    };
    use crate::store::{NewWorkflow, Store, StageRepository, TaskRepository, WorkflowRepository};

    fn pipeline() -> PipelineSpec {
        PipelineSpec {
            stages: vec![
                StageSpec {
                    name: "reads".into(),
                    kind: StageKind::Source(
                        ["s1", "s2"]
                            .iter()
                            .map(|s| SourceTask {
                                tags: TagSet::from_pairs([("sample", *s)]),
                                files: vec![SourceFile {
                                    name: "fastq".into(),
                                    path: PathBuf::from(format!("/data/{}.fq.gz", s)),
                                    format: None,
                                }],
                            })
                            .collect(),
                    ),
                    extra_tags: TagSet::new(),
                },
                StageSpec {
                    name: "align".into(),
                    kind: StageKind::Tool {
                        tool: ToolSpec {
                            command: "bwa mem {in.fastq} > $OUT.bam # {sample} in {out_dir}"
                                .into(),
                            outputs: vec![OutputSpec {
                                name: "bam".into(),
                                path: "{sample}.bam".into(),
                                format: None,
                                persist: false,
                            }],
                            resources: Resources::new(Some(4000), 2, None),
                            noop: false,
                            succeed_on_failure: false,
                        },
                        parents: vec!["reads".into()],
                        strategy: ShardStrategy::OneToOne,
                    },
                    extra_tags: TagSet::new(),
                },
            ],
        }
    }

    fn workflow(store: &mut Store) -> Workflow {
        store
            .create_workflow(NewWorkflow {
                name: "wf".into(),
                output_dir: PathBuf::from("/out"),
                dry_run: false,
                max_cores: 0,
                max_reattempts: 0,
                terminate_on_failure: true,
                delete_intermediates: false,
                default_queue: None,
            })
            .unwrap()
    }

    #[test]
    fn test_materialize_renders_commands_and_files() {
        let mut store = Store::in_memory();
        let wf = workflow(&mut store);
        let spec = pipeline();
        let graph = resolve(&spec).unwrap();

        let m = materialize(&mut store, &wf, &spec, &graph).unwrap();
        assert_eq!(m.created, 4);
        assert_eq!(m.task_of_node.len(), 4);

        let align = &m.stages[1];
        let tasks = store.tasks_of_stage(align.id).unwrap();
        let s1 = tasks
            .iter()
            .find(|t| t.tags.get("sample") == Some("s1"))
            .unwrap();
        assert_eq!(
            s1.command,
            "bwa mem /data/s1.fq.gz > $OUT.bam # s1 in /out/align/sample-s1"
        );
        let out = store.task_file(s1.output_files[0]).unwrap();
        assert_eq!(out.path, PathBuf::from("/out/align/sample-s1/s1.bam"));
        assert_eq!(out.format, "bam");
        assert_eq!(s1.input_files.len(), 1);
        assert_eq!(store.parents_of(s1.id).unwrap().len(), 1);

        let reads = store.tasks_of_stage(m.stages[0].id).unwrap();
        assert!(reads.iter().all(|t| t.noop));
        let fq = store.task_file(reads[0].output_files[0]).unwrap();
        assert_eq!(fq.format, "fq.gz");
        assert!(fq.persist);
    }

    #[test]
    fn test_successful_history_is_reused() {
        let mut store = Store::in_memory();
        let wf = workflow(&mut store);
        let spec = pipeline();
        let graph = resolve(&spec).unwrap();
        materialize(&mut store, &wf, &spec, &graph).unwrap();

        for mut task in store.tasks_of_workflow(wf.id).unwrap() {
            task.status = Status::Successful;
            store.update_task(&task).unwrap();
        }

        let again = materialize(&mut store, &wf, &spec, &graph).unwrap();
        assert_eq!(again.created, 0);
        assert_eq!(again.reused, 4);
        assert_eq!(store.tasks_of_workflow(wf.id).unwrap().len(), 4);
    }

    #[test]
    fn test_recreated_parent_invalidates_successful_child() {
        let mut store = Store::in_memory();
        let wf = workflow(&mut store);
        let spec = pipeline();
        let graph = resolve(&spec).unwrap();
        let first = materialize(&mut store, &wf, &spec, &graph).unwrap();

        for mut task in store.tasks_of_workflow(wf.id).unwrap() {
            // s2's input never succeeded; everything else did.
            task.status = if task.stage_id == first.stages[0].id
                && task.tags.get("sample") == Some("s2")
            {
                Status::Failed
            } else {
                Status::Successful
            };
            store.update_task(&task).unwrap();
        }

        let again = materialize(&mut store, &wf, &spec, &graph).unwrap();
        assert_eq!(again.reused, 2);
        assert_eq!(again.created, 2);
        assert_eq!(again.invalidated.len(), 2);
    }

    #[test]
    fn test_undeclared_output_marker_is_template_error() {
        let mut spec = pipeline();
        if let StageKind::Tool { tool, .. } = &mut spec.stages[1].kind {
            tool.command = "bwa mem {in.fastq} > $OUT.sam".into();
        }
        let mut store = Store::in_memory();
        let wf = workflow(&mut store);
        let graph = resolve(&spec).unwrap();
        let err = materialize(&mut store, &wf, &spec, &graph).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::Template(TemplateError::MissingOutputs { .. }))
        ));
    }

    #[test]
    fn test_missing_keyword_slot_is_template_error() {
        let mut spec = pipeline();
        if let StageKind::Tool { tool, .. } = &mut spec.stages[1].kind {
            tool.command = "bwa mem {in.reads} > $OUT.bam".into();
        }
        let mut store = Store::in_memory();
        let wf = workflow(&mut store);
        let graph = resolve(&spec).unwrap();
        let err = materialize(&mut store, &wf, &spec, &graph).unwrap_err();
        match err {
            StoreError::Domain(DomainError::Template(TemplateError::MissingKeys {
                missing,
                available,
                ..
            })) => {
                assert_eq!(missing, vec!["in.reads".to_string()]);
                assert!(available.contains_key("in.fastq"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
