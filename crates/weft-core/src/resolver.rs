//! Expands a stage-level pipeline description into concrete tool instances.
//!
//! Stages are visited in topological order of the stage graph. Each stage's
//! [`ShardStrategy`] is applied to the instances already produced for its
//! parent stages, so every edge points from an earlier node to a later one
//! and the resulting graph is acyclic by construction.

use crate::errors::DomainError;
use crate::model::{Resources, TagSet};
use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStrategy {
    OneToOne,
    /// Group parent instances by their projection onto these tag keys.
    ManyToOne(Vec<String>),
    /// Cartesian product of `(tag key, values)` pairs per parent instance.
    OneToMany(Vec<(String, Vec<String>)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSpec {
    pub name: String,
    /// Relative to the task's output directory unless absolute. May contain
    /// `{tag}` slots.
    pub path: String,
    pub format: Option<String>,
    pub persist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub command: String,
    pub outputs: Vec<OutputSpec>,
    pub resources: Resources,
    pub noop: bool,
    pub succeed_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub path: PathBuf,
    pub format: Option<String>,
}

/// A pre-existing input, materialized as a NOOP task owning `files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTask {
    pub tags: TagSet,
    pub files: Vec<SourceFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    Source(Vec<SourceTask>),
    Tool {
        tool: ToolSpec,
        parents: Vec<String>,
        strategy: ShardStrategy,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub kind: StageKind,
    /// Added to every instance of the stage, overriding inherited values.
    pub extra_tags: TagSet,
}

impl StageSpec {
    pub fn parents(&self) -> &[String] {
        match &self.kind {
            StageKind::Source(_) => &[],
            StageKind::Tool { parents, .. } => parents,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSpec {
    pub stages: Vec<StageSpec>,
}

/// One node of the resolved graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInstance {
    /// Index into [`PipelineSpec::stages`].
    pub stage: usize,
    pub tags: TagSet,
    /// Indices into [`ResolvedGraph::nodes`], always smaller than this node's.
    pub parents: Vec<usize>,
}

/// Immutable output of [`resolve`]: nodes in creation order plus the stage
/// visiting order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedGraph {
    pub stage_order: Vec<usize>,
    pub nodes: Vec<ToolInstance>,
    /// Node indices per spec stage index.
    pub by_stage: Vec<Vec<usize>>,
}

impl ResolvedGraph {
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .flat_map(|(child, node)| node.parents.iter().map(move |&parent| (parent, child)))
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|n| n.parents.len()).sum()
    }

    pub fn is_acyclic(&self) -> bool {
        let n = self.nodes.len();
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::with_capacity(n, self.edge_count());
        for i in 0..n {
            graph.add_node(i);
        }
        for (parent, child) in self.edges() {
            if parent >= n {
                return false;
            }
            graph.add_edge(parent, child, ());
        }
        !is_cyclic_directed(&graph)
    }
}

fn validate(spec: &PipelineSpec) -> Result<HashMap<&str, usize>, DomainError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, stage) in spec.stages.iter().enumerate() {
        if index.insert(stage.name.as_str(), i).is_some() {
            return Err(DomainError::DuplicateStage(stage.name.clone()));
        }
    }

    for stage in &spec.stages {
        for parent in stage.parents() {
            if !index.contains_key(parent.as_str()) {
                return Err(DomainError::UnknownParentStage {
                    stage: stage.name.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let StageKind::Tool {
            tool,
            parents,
            strategy,
        } = &stage.kind
        else {
            continue;
        };

        if parents.is_empty() {
            return Err(DomainError::MissingParents {
                stage: stage.name.clone(),
            });
        }

        let mut output_names = HashSet::new();
        for output in &tool.outputs {
            if !output_names.insert(output.name.as_str()) {
                return Err(DomainError::DuplicateOutput {
                    stage: stage.name.clone(),
                    output: output.name.clone(),
                });
            }
        }

        match strategy {
            ShardStrategy::OneToOne => {}
            ShardStrategy::ManyToOne(keys) => {
                if keys.is_empty() {
                    return Err(DomainError::InvalidShard {
                        stage: stage.name.clone(),
                        reason: "many2one requires at least one grouping key".into(),
                    });
                }
            }
            ShardStrategy::OneToMany(splits) => {
                if splits.is_empty() {
                    return Err(DomainError::InvalidShard {
                        stage: stage.name.clone(),
                        reason: "one2many requires at least one split".into(),
                    });
                }
                let mut split_keys = HashSet::new();
                for (key, values) in splits {
                    if values.is_empty() {
                        return Err(DomainError::InvalidShard {
                            stage: stage.name.clone(),
                            reason: format!("split '{}' has no values", key),
                        });
                    }
                    if !split_keys.insert(key.as_str()) {
                        return Err(DomainError::InvalidShard {
                            stage: stage.name.clone(),
                            reason: format!("split key '{}' is listed more than once", key),
                        });
                    }
                }
            }
        }
    }

    Ok(index)
}

/// Orders stages so that every stage follows its parents. A declaration that
/// is already in dependency order is returned unchanged.
pub fn toposort_stages(spec: &PipelineSpec) -> Result<Vec<usize>, DomainError> {
    let index = validate(spec)?;
    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for i in 0..spec.stages.len() {
        graph.add_node(i);
    }
    for (i, stage) in spec.stages.iter().enumerate() {
        for parent in stage.parents() {
            if let Some(&p) = index.get(parent.as_str()) {
                graph.add_edge(p, i, ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let stuck = cycle.node_id();
        let mut members = tarjan_scc(&graph)
            .into_iter()
            .find(|scc| scc.contains(&stuck))
            .unwrap_or_else(|| vec![stuck]);
        members.sort_unstable();
        DomainError::StageCycle(
            members
                .into_iter()
                .map(|i| spec.stages[i].name.clone())
                .collect(),
        )
    })
}

fn cartesian(splits: &[(String, Vec<String>)]) -> Vec<TagSet> {
    let mut combos = vec![TagSet::new()];
    for (key, values) in splits {
        combos = combos
            .iter()
            .flat_map(|combo| {
                values.iter().map(move |value| {
                    let mut next = combo.clone();
                    next.insert(key.clone(), value.clone());
                    next
                })
            })
            .collect();
    }
    combos
}

/// Resolves `spec` into a graph of tool instances.
pub fn resolve(spec: &PipelineSpec) -> Result<ResolvedGraph, DomainError> {
    let stage_order = toposort_stages(spec)?;
    let index: HashMap<&str, usize> = spec
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut graph = ResolvedGraph {
        stage_order: stage_order.clone(),
        nodes: Vec::new(),
        by_stage: vec![Vec::new(); spec.stages.len()],
    };

    for &stage_idx in &stage_order {
        let stage = &spec.stages[stage_idx];
        let produced: Vec<(TagSet, Vec<usize>)> = match &stage.kind {
            StageKind::Source(tasks) => tasks
                .iter()
                .map(|t| (t.tags.merged(&stage.extra_tags), Vec::new()))
                .collect(),
            StageKind::Tool {
                parents, strategy, ..
            } => {
                let mut parent_nodes: Vec<usize> = Vec::new();
                let mut seen_stages = HashSet::new();
                for p in parents {
                    if let Some(&p_idx) = index.get(p.as_str()) {
                        if seen_stages.insert(p_idx) {
                            parent_nodes.extend(graph.by_stage[p_idx].iter().copied());
                        }
                    }
                }
                apply_strategy(&graph, stage, strategy, &parent_nodes)?
            }
        };

        let mut seen_tags: HashSet<&TagSet> = HashSet::new();
        for (tags, _) in &produced {
            if !seen_tags.insert(tags) {
                return Err(DomainError::DuplicateTags {
                    stage: stage.name.clone(),
                    tags: tags.clone(),
                });
            }
        }

        for (tags, parents) in produced {
            let node_idx = graph.nodes.len();
            graph.nodes.push(ToolInstance {
                stage: stage_idx,
                tags,
                parents,
            });
            graph.by_stage[stage_idx].push(node_idx);
        }

        tracing::debug!(
            "Resolved stage '{}' into {} instance(s)",
            stage.name,
            graph.by_stage[stage_idx].len()
        );
    }

    Ok(graph)
}

fn apply_strategy(
    graph: &ResolvedGraph,
    stage: &StageSpec,
    strategy: &ShardStrategy,
    parent_nodes: &[usize],
) -> Result<Vec<(TagSet, Vec<usize>)>, DomainError> {
    let out = match strategy {
        ShardStrategy::OneToOne => {
            // Parents from several stages that share a tag set feed one child.
            let mut groups: Vec<(TagSet, Vec<usize>)> = Vec::new();
            let mut slot: HashMap<&TagSet, usize> = HashMap::new();
            for &p in parent_nodes {
                let tags = &graph.nodes[p].tags;
                match slot.get(tags) {
                    Some(&i) => groups[i].1.push(p),
                    None => {
                        slot.insert(tags, groups.len());
                        groups.push((tags.clone(), vec![p]));
                    }
                }
            }
            groups
                .into_iter()
                .map(|(tags, parents)| (tags.merged(&stage.extra_tags), parents))
                .collect()
        }
        ShardStrategy::ManyToOne(keys) => {
            if !parent_nodes
                .iter()
                .any(|&p| graph.nodes[p].tags.contains_all(keys))
            {
                return Err(DomainError::NoGroupingKeys {
                    stage: stage.name.clone(),
                    keys: keys.clone(),
                });
            }
            let mut groups: BTreeMap<TagSet, Vec<usize>> = BTreeMap::new();
            for &p in parent_nodes {
                groups
                    .entry(graph.nodes[p].tags.project(keys))
                    .or_default()
                    .push(p);
            }
            groups
                .into_iter()
                .map(|(tags, parents)| (tags.merged(&stage.extra_tags), parents))
                .collect()
        }
        ShardStrategy::OneToMany(splits) => {
            let combos = cartesian(splits);
            parent_nodes
                .iter()
                .flat_map(|&p| {
                    let parent_tags = &graph.nodes[p].tags;
                    combos.iter().map(move |combo| {
                        (
                            parent_tags.merged(combo).merged(&stage.extra_tags),
                            vec![p],
                        )
                    })
                })
                .collect()
        }
    };
    Ok(out)
}
