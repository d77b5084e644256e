//! TOML pipeline definitions.
//!
//! ```toml
//! [[stage]]
//! name = "reads"
//! [[stage.input]]
//! tags = { sample = "s1" }
//! files = [{ name = "fastq", path = "/data/s1.fq.gz" }]
//!
//! [[stage]]
//! name = "align"
//! parents = ["reads"]
//! command = "bwa mem ref.fa {in.fastq} > $OUT.bam"
//! cpus = 4
//! [[stage.outputs]]
//! name = "bam"
//! path = "{sample}.bam"
//! ```

use crate::errors::ConfigError;
use crate::model::{Resources, TagSet};
use crate::resolver::{
    OutputSpec, PipelineSpec, ShardStrategy, SourceFile, SourceTask, StageKind, StageSpec,
    ToolSpec,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    #[default]
    One2one,
    Many2one,
    One2many,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileDef {
    pub name: String,
    pub path: PathBuf,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDef {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<FileDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDef {
    pub name: String,
    pub path: String,
    pub format: Option<String>,
    #[serde(default)]
    pub persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub shard: ShardKind,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub splits: BTreeMap<String, Vec<String>>,
    pub command: Option<String>,
    #[serde(default)]
    pub outputs: Vec<OutputDef>,
    pub mem_mb: Option<u32>,
    pub cpus: Option<u32>,
    pub time_min: Option<u32>,
    #[serde(default)]
    pub noop: bool,
    #[serde(default)]
    pub succeed_on_failure: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub input: Vec<InputDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageDef>,
}

impl StageDef {
    fn into_spec(self, base_dir: &Path) -> Result<StageSpec, ConfigError> {
        let extra_tags = TagSet(self.tags);

        if self.parents.is_empty() {
            if self.command.is_some() {
                return Err(ConfigError::General(format!(
                    "Stage '{}' has a command but no parents; source stages declare [[stage.input]] entries instead",
                    self.name
                )));
            }
            let tasks = self
                .input
                .into_iter()
                .map(|input| SourceTask {
                    tags: TagSet(input.tags),
                    files: input
                        .files
                        .into_iter()
                        .map(|f| SourceFile {
                            name: f.name,
                            path: if f.path.is_absolute() {
                                f.path
                            } else {
                                base_dir.join(f.path)
                            },
                            format: f.format,
                        })
                        .collect(),
                })
                .collect();
            return Ok(StageSpec {
                name: self.name,
                kind: StageKind::Source(tasks),
                extra_tags,
            });
        }

        if !self.input.is_empty() {
            return Err(ConfigError::General(format!(
                "Stage '{}' has parents and must not declare [[stage.input]] entries",
                self.name
            )));
        }

        let command = match (self.command, self.noop) {
            (Some(c), _) => c,
            (None, true) => String::new(),
            (None, false) => {
                return Err(ConfigError::General(format!(
                    "Stage '{}' has no command (set noop = true for pass-through stages)",
                    self.name
                )))
            }
        };

        let strategy = match self.shard {
            ShardKind::One2one => ShardStrategy::OneToOne,
            ShardKind::Many2one => ShardStrategy::ManyToOne(self.keys),
            ShardKind::One2many => ShardStrategy::OneToMany(self.splits.into_iter().collect()),
        };

        let tool = ToolSpec {
            command,
            outputs: self
                .outputs
                .into_iter()
                .map(|o| OutputSpec {
                    name: o.name,
                    path: o.path,
                    format: o.format,
                    persist: o.persist,
                })
                .collect(),
            resources: Resources::new(self.mem_mb, self.cpus.unwrap_or(1), self.time_min),
            noop: self.noop,
            succeed_on_failure: self.succeed_on_failure,
        };

        Ok(StageSpec {
            name: self.name,
            kind: StageKind::Tool {
                tool,
                parents: self.parents,
                strategy,
            },
            extra_tags,
        })
    }
}

pub fn parse_pipeline(content: &str, base_dir: &Path) -> Result<PipelineSpec, ConfigError> {
    let file: PipelineFile = toml::from_str(content)?;
    let stages = file
        .stages
        .into_iter()
        .map(|s| s.into_spec(base_dir))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PipelineSpec { stages })
}

/// Loads a pipeline file. Relative input paths resolve against its directory.
pub fn load_pipeline(path: &Path) -> Result<PipelineSpec, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::PipelineNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::PathIo {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_pipeline(&content, base_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
[[stage]]
name = "reads"
[[stage.input]]
tags = { sample = "s1", lane = "1" }
files = [{ name = "fastq", path = "s1_L1.fq.gz" }]
[[stage.input]]
tags = { sample = "s1", lane = "2" }
files = [{ name = "fastq", path = "/abs/s1_L2.fq.gz", format = "fastq.gz" }]

[[stage]]
name = "align"
parents = ["reads"]
command = "bwa mem ref.fa {in.fastq} > $OUT.bam"
cpus = 4
mem_mb = 8000
tags = { ref = "hg38" }
[[stage.outputs]]
name = "bam"
path = "{sample}_{lane}.bam"

[[stage]]
name = "merge"
parents = ["align"]
shard = "many2one"
keys = ["sample"]
command = "samtools merge $OUT.bam {in.bam}"
[[stage.outputs]]
name = "bam"
path = "merged.bam"
persist = true

[[stage]]
name = "call"
parents = ["merge"]
shard = "one2many"
splits = { chr = ["1", "2"] }
command = "call {in.bam} {chr} > $OUT.vcf"
succeed_on_failure = true
[[stage.outputs]]
name = "vcf"
path = "calls.vcf"
"#;

    #[test]
    fn test_parse_pipeline() {
        let spec = parse_pipeline(PIPELINE, Path::new("/data")).unwrap();
        assert_eq!(spec.stages.len(), 4);

        let StageKind::Source(tasks) = &spec.stages[0].kind else {
            panic!("reads should be a source stage");
        };
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].files[0].path, PathBuf::from("/data/s1_L1.fq.gz"));
        assert_eq!(tasks[1].files[0].path, PathBuf::from("/abs/s1_L2.fq.gz"));
        assert_eq!(tasks[1].files[0].format.as_deref(), Some("fastq.gz"));

        let StageKind::Tool { tool, strategy, .. } = &spec.stages[1].kind else {
            panic!("align should be a tool stage");
        };
        assert_eq!(*strategy, ShardStrategy::OneToOne);
        assert_eq!(tool.resources, Resources::new(Some(8000), 4, None));
        assert_eq!(spec.stages[1].extra_tags.get("ref"), Some("hg38"));
        assert!(!tool.outputs[0].persist);

        let StageKind::Tool { strategy, .. } = &spec.stages[2].kind else {
            panic!("merge should be a tool stage");
        };
        assert_eq!(*strategy, ShardStrategy::ManyToOne(vec!["sample".into()]));

        let StageKind::Tool { tool, strategy, .. } = &spec.stages[3].kind else {
            panic!("call should be a tool stage");
        };
        assert_eq!(
            *strategy,
            ShardStrategy::OneToMany(vec![("chr".into(), vec!["1".into(), "2".into()])])
        );
        assert!(tool.succeed_on_failure);
    }

    #[test]
    fn test_unknown_shard_rejected() {
        let err = parse_pipeline(
            "[[stage]]\nname = \"a\"\nparents = [\"b\"]\nshard = \"all2all\"\ncommand = \"x\"\n",
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn test_tool_stage_without_command_rejected() {
        let err = parse_pipeline(
            "[[stage]]\nname = \"a\"\nparents = [\"b\"]\n",
            Path::new("."),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no command"));
    }

    #[test]
    fn test_missing_pipeline_file() {
        let err = load_pipeline(Path::new("/nonexistent/weft/pipeline.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::PipelineNotFound(_)));
    }
}
