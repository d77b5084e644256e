use weft_core::config::{ResourceRule, Resources as ResourceConfig};
use weft_core::model::Resources;
use wildmatch::WildMatch;

/// Backend-native resource request for one submission.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NativeSpec {
    pub queue: Option<String>,
    pub mem_mb: Option<u32>,
    pub cpus: Option<u32>,
    pub time_min: Option<u32>,
}

fn format_runtime(minutes: u32) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

impl NativeSpec {
    /// `qsub` arguments, e.g. `-q long.q -l h_vmem=4096M,num_proc=2,h_rt=01:30:00`.
    pub fn to_ge_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(q) = &self.queue {
            args.push("-q".to_string());
            args.push(q.clone());
        }
        let mut limits = Vec::new();
        if let Some(m) = self.mem_mb {
            limits.push(format!("h_vmem={}M", m));
        }
        if let Some(c) = self.cpus {
            limits.push(format!("num_proc={}", c));
        }
        if let Some(t) = self.time_min {
            limits.push(format!("h_rt={}", format_runtime(t)));
        }
        if !limits.is_empty() {
            args.push("-l".to_string());
            args.push(limits.join(","));
        }
        args
    }

    pub fn to_native_string(&self) -> String {
        self.to_ge_args().join(" ")
    }
}

fn merge_rule(current: &mut NativeSpec, rule: &ResourceRule) {
    if let Some(val) = &rule.queue {
        current.queue = Some(val.clone());
    }
    if let Some(val) = rule.mem_mb {
        current.mem_mb = Some(val);
    }
    if let Some(val) = rule.cpus {
        current.cpus = Some(val);
    }
    if let Some(val) = rule.time_min {
        current.time_min = Some(val);
    }
}

/// Config defaults, then the workflow queue, then the task's own
/// requirements, then every matching rule in file order.
pub fn resolve_for_stage(
    stage_name: &str,
    requested: &Resources,
    config: &ResourceConfig,
    default_queue: Option<&str>,
) -> NativeSpec {
    let mut current = NativeSpec {
        queue: config.defaults.queue.clone(),
        mem_mb: config.defaults.mem_mb,
        cpus: config.defaults.cpus,
        time_min: config.defaults.time_min,
    };

    if let Some(q) = default_queue {
        current.queue = Some(q.to_string());
    }
    if let Some(m) = requested.mem_req_mb {
        current.mem_mb = Some(m);
    }
    current.cpus = Some(requested.cpu_req);
    if let Some(t) = requested.time_req_min {
        current.time_min = Some(t);
    }

    for rule in &config.rules {
        let glob_matches = rule
            .stage_glob
            .as_ref()
            .is_none_or(|glob| WildMatch::new(glob).matches(stage_name));
        if glob_matches {
            merge_rule(&mut current, rule);
        }
    }

    tracing::debug!(
        "Resolved native resources for stage '{}': {:?}",
        stage_name,
        current
    );
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_resources() -> ResourceConfig {
        toml::from_str(
            r#"
[defaults]
queue = "all.q"
mem_mb = 1024
time_min = 60

[[rules]]
stage_glob = "align*"
mem_mb = 16000
cpus = 8

[[rules]]
stage_glob = "align_long"
queue = "long.q"
time_min = 1440

[[rules]]
queue = "override.q"
stage_glob = "qc_*"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_fill_gaps() {
        let res = get_test_resources();
        let spec = resolve_for_stage("sort", &Resources::default(), &res, None);
        assert_eq!(spec.queue.as_deref(), Some("all.q"));
        assert_eq!(spec.mem_mb, Some(1024));
        assert_eq!(spec.cpus, Some(1));
        assert_eq!(spec.time_min, Some(60));
    }

    #[test]
    fn test_task_requirements_beat_defaults() {
        let res = get_test_resources();
        let spec = resolve_for_stage("sort", &Resources::new(Some(4096), 2, None), &res, None);
        assert_eq!(spec.mem_mb, Some(4096));
        assert_eq!(spec.cpus, Some(2));
        assert_eq!(spec.time_min, Some(60));
    }

    #[test]
    fn test_later_rules_win() {
        let res = get_test_resources();
        let spec = resolve_for_stage("align_long", &Resources::new(Some(2000), 2, None), &res, None);
        assert_eq!(spec.mem_mb, Some(16000));
        assert_eq!(spec.cpus, Some(8));
        assert_eq!(spec.queue.as_deref(), Some("long.q"));
        assert_eq!(spec.time_min, Some(1440));
    }

    #[test]
    fn test_workflow_queue_overrides_default_but_not_rules() {
        let res = get_test_resources();
        let spec = resolve_for_stage("sort", &Resources::default(), &res, Some("short.q"));
        assert_eq!(spec.queue.as_deref(), Some("short.q"));
        let spec = resolve_for_stage("qc_reads", &Resources::default(), &res, Some("short.q"));
        assert_eq!(spec.queue.as_deref(), Some("override.q"));
    }

    #[test]
    fn test_ge_args() {
        let spec = NativeSpec {
            queue: Some("long.q".into()),
            mem_mb: Some(4096),
            cpus: Some(2),
            time_min: Some(90),
        };
        assert_eq!(
            spec.to_native_string(),
            "-q long.q -l h_vmem=4096M,num_proc=2,h_rt=01:30:00"
        );
        assert!(NativeSpec::default().to_ge_args().is_empty());
    }
}
