use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use weft_core::config::Settings;
use weft_core::store::{snapshot_path, Store};

/// Scratch root for one test: XDG config and cache dirs, an output root, a
/// store dir and a place for input files.
pub struct TestContext {
    pub _temp_dir: tempfile::TempDir,
    pub test_root: PathBuf,
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub output_root: PathBuf,
    pub store_dir: PathBuf,
    pub inputs_dir: PathBuf,
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_engine_config("")
    }

    /// `engine` is appended to the `[engine]` table of the generated config.
    pub fn with_engine_config(engine: &str) -> Self {
        let temp_dir = tempfile::Builder::new()
            .prefix("weft-test-")
            .tempdir()
            .expect("Failed to create temp dir");
        let test_root = temp_dir.path().to_path_buf();

        let config_dir = test_root.join("config");
        let cache_dir = test_root.join("cache");
        let output_root = test_root.join("output");
        let store_dir = test_root.join("store");
        let inputs_dir = test_root.join("inputs");
        for dir in [&config_dir, &cache_dir, &output_root, &store_dir, &inputs_dir] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }

        let weft_config_subdir = config_dir.join("weft");
        fs::create_dir(&weft_config_subdir).expect("Failed to create weft config subdir");
        let config_content = format!(
            r#"
output_root = "{}"
store_dir = "{}"

[engine]
poll_interval_ms = 10
wait_timeout_secs = 1
{}
"#,
            output_root.display(),
            store_dir.display(),
            engine
        );
        fs::write(weft_config_subdir.join("config.toml"), config_content)
            .expect("Failed to write temp config");

        Self {
            _temp_dir: temp_dir,
            test_root,
            config_dir,
            cache_dir,
            output_root,
            store_dir,
            inputs_dir,
        }
    }

    /// Settings matching the generated config, for in-process tests.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::for_root(&self.test_root);
        settings.output_root = self.output_root.clone();
        settings.store_dir = self.store_dir.clone();
        settings.poll_interval = Duration::from_millis(10);
        settings.wait_timeout = Duration::from_secs(1);
        settings
    }

    pub fn write_pipeline(&self, file_name: &str, content: &str) -> PathBuf {
        let path = self.test_root.join(file_name);
        fs::write(&path, content).expect("Failed to write pipeline");
        path
    }

    pub fn write_input(&self, file_name: &str, content: &str) -> PathBuf {
        let path = self.inputs_dir.join(file_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create input dir");
        }
        fs::write(&path, content).expect("Failed to write input");
        path
    }

    pub fn store_path(&self, workflow: &str) -> PathBuf {
        snapshot_path(&self.store_dir, workflow)
    }

    pub fn open_store(&self, workflow: &str) -> Store {
        Store::open(&self.store_path(workflow)).expect("Failed to open store")
    }

    /// Raw JSON snapshot of a workflow's store.
    pub fn snapshot(&self, workflow: &str) -> Value {
        let content = fs::read(self.store_path(workflow)).expect("Store snapshot missing");
        serde_json::from_slice(&content).expect("Store snapshot is not JSON")
    }

    pub fn workflow_dir(&self, workflow: &str) -> PathBuf {
        self.output_root.join(workflow)
    }

    pub fn read(&self, path: &Path) -> String {
        fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e))
    }
}
