//! Resource-usage reports written by the out-of-process sampler.
//!
//! The sampler wraps the job's command and, on exit, dumps a flat JSON object
//! keyed by the field names below. A missing or malformed report means "no
//! usage data" and is never an error for the task.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rss_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_rss_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vms_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_vms_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_read_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_write_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_wait: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voluntary_ctx_switches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub involuntary_ctx_switches: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_polls: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_num_descendants: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_num_descendants: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

impl ResourceUsage {
    pub fn is_empty(&self) -> bool {
        *self == ResourceUsage::default()
    }
}

/// Reads a sampler report. `None` when the file is absent, unreadable,
/// malformed, or carries no known field.
pub fn read_report(path: &Path) -> Option<ResourceUsage> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No usage report at {}", path.display());
            return None;
        }
        Err(e) => {
            tracing::warn!("Failed to read usage report {}: {}", path.display(), e);
            return None;
        }
    };

    match serde_json::from_str::<ResourceUsage>(&content) {
        Ok(usage) if usage.is_empty() => None,
        Ok(usage) => Some(usage),
        Err(e) => {
            tracing::warn!(
                "Ignoring malformed usage report {}: {}",
                path.display(),
                e
            );
            None
        }
    }
}
