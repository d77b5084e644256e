use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;
use weft_core::config::Settings;
use weft_core::model::{QueueStatus, Resources, TagSet, Task};
use weft_core::store::{
    AttemptRepository, NewTask, NewWorkflow, StageRepository, Store, TaskBatch, TaskRepository,
    WorkflowRepository,
};
use weft_executor::{ExecutorError, GridEngineJobManager, JobManager, JobRequest};

struct FakeGe {
    bin: PathBuf,
}

impl FakeGe {
    /// `qsub` logs its arguments and, when `run_jobs` is set, runs the
    /// wrapper synchronously so the job is already finished when qstat runs.
    fn new(root: &Path, run_jobs: bool, qstat_body: &str) -> Self {
        let bin = root.join("bin");
        fs::create_dir_all(&bin).unwrap();
        let run = if run_jobs {
            "for last; do :; done\n\"$last\" >/dev/null 2>&1\n"
        } else {
            ""
        };
        Self::script(
            &bin.join("qsub"),
            &format!(
                "#!/bin/sh\necho \"$@\" >> \"{}\"\n{}echo 4242\n",
                bin.join("qsub.log").display(),
                run
            ),
        );
        Self::script(&bin.join("qstat"), &format!("#!/bin/sh\n{}\n", qstat_body));
        Self::script(
            &bin.join("qdel"),
            &format!("#!/bin/sh\necho \"$@\" >> \"{}\"\n", bin.join("qdel.log").display()),
        );
        Self { bin }
    }

    fn script(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn settings(&self, root: &Path) -> Settings {
        let mut settings = Settings::for_root(root);
        settings.poll_interval = Duration::from_millis(10);
        settings.ge.qsub = self.bin.join("qsub").display().to_string();
        settings.ge.qstat = self.bin.join("qstat").display().to_string();
        settings.ge.qdel = self.bin.join("qdel").display().to_string();
        settings.default_queue = Some("short.q".into());
        settings
    }

    fn log(&self, name: &str) -> String {
        fs::read_to_string(self.bin.join(name)).unwrap_or_default()
    }
}

const QSTAT_EMPTY: &str = "exit 0";
const QSTAT_RUNNING: &str = r#"echo "job-ID  prior   name       user  state"
echo "-----------------------------------------------"
echo "4242 0.55500 weft_1     me    r""#;

fn setup(root: &Path) -> (Store, Task) {
    let mut store = Store::in_memory();
    let wf = store
        .create_workflow(NewWorkflow {
            name: "ge".into(),
            output_dir: root.join("out"),
            dry_run: false,
            max_cores: 0,
            max_reattempts: 0,
            terminate_on_failure: true,
            delete_intermediates: false,
            default_queue: Some("short.q".into()),
        })
        .unwrap();
    let stage = store.get_or_create_stage(wf.id, "align", 0).unwrap();
    let mut batch = TaskBatch::new();
    batch.push(NewTask {
        stage_id: stage.id,
        tags: TagSet::from_pairs([("sample", "s1")]),
        command: String::new(),
        resources: Resources::new(Some(4096), 2, Some(90)),
        noop: false,
        succeed_on_failure: false,
        output_dir: root.join("out/align/s1"),
        outputs: vec![],
        input_files: vec![],
        parents: vec![],
    });
    let task = store.insert_tasks(batch).unwrap().remove(0);
    (store, task)
}

fn submit(
    mgr: &mut GridEngineJobManager,
    store: &mut Store,
    task: &Task,
    command: &str,
) -> Result<weft_core::model::JobAttempt, ExecutorError> {
    let attempt = store.create_attempt(task.id).unwrap();
    mgr.submit(JobRequest {
        task,
        stage_name: "align",
        attempt,
        command: command.into(),
    })
}

#[test]
fn test_submit_passes_native_resources() {
    let dir = tempdir().unwrap();
    let ge = FakeGe::new(dir.path(), true, QSTAT_EMPTY);
    let (mut store, task) = setup(dir.path());
    let mut mgr = GridEngineJobManager::new(&ge.settings(dir.path())).unwrap();

    let queued = submit(&mut mgr, &mut store, &task, "true").unwrap();
    assert_eq!(queued.drm_job_id.as_deref(), Some("4242"));
    assert_eq!(queued.queue_status, QueueStatus::Queued);

    let log = ge.log("qsub.log");
    assert!(log.contains("-terse"));
    assert!(log.contains(&format!("-N weft_{}", task.id.0)));
    assert!(log.contains("-q short.q -l h_vmem=4096M,num_proc=2,h_rt=01:30:00"));
    assert!(log.trim_end().ends_with("command.sh"));
}

#[test]
fn test_vanished_job_reads_exit_marker() {
    let dir = tempdir().unwrap();
    let ge = FakeGe::new(dir.path(), true, QSTAT_EMPTY);
    let (mut store, task) = setup(dir.path());
    let mut mgr = GridEngineJobManager::new(&ge.settings(dir.path())).unwrap();

    submit(&mut mgr, &mut store, &task, "exit 4").unwrap();
    let done = mgr
        .next_completed(Some(Duration::from_secs(5)))
        .unwrap()
        .unwrap();
    assert!(!done.successful);
    assert_eq!(done.exit_status, Some(4));
    assert_eq!(done.queue_status, QueueStatus::Completed);
    assert_eq!(mgr.queued_count(), 0);
    assert!(mgr.next_completed(Some(Duration::ZERO)).unwrap().is_none());
}

#[test]
fn test_job_without_marker_counts_as_aborted() {
    let dir = tempdir().unwrap();
    let ge = FakeGe::new(dir.path(), false, QSTAT_EMPTY);
    let (mut store, task) = setup(dir.path());
    let mut mgr = GridEngineJobManager::new(&ge.settings(dir.path())).unwrap();

    submit(&mut mgr, &mut store, &task, "true").unwrap();
    let done = mgr
        .next_completed(Some(Duration::from_secs(5)))
        .unwrap()
        .unwrap();
    assert!(!done.successful);
    assert_eq!(done.exit_status, None);
}

#[test]
fn test_running_job_times_out_and_can_be_deleted() {
    let dir = tempdir().unwrap();
    let ge = FakeGe::new(dir.path(), false, QSTAT_RUNNING);
    let (mut store, task) = setup(dir.path());
    let mut mgr = GridEngineJobManager::new(&ge.settings(dir.path())).unwrap();

    let queued = submit(&mut mgr, &mut store, &task, "true").unwrap();
    assert!(mgr
        .next_completed(Some(Duration::from_millis(100)))
        .unwrap()
        .is_none());
    assert_eq!(mgr.queued_count(), 1);

    let err = submit(&mut mgr, &mut store, &task, "true").unwrap_err();
    assert!(matches!(err, ExecutorError::AlreadyQueued(_)));

    mgr.terminate(queued.id);
    assert_eq!(ge.log("qdel.log").trim(), "4242");
    assert_eq!(mgr.queued_count(), 0);
}

#[test]
fn test_qstat_failure_is_not_fatal() {
    let dir = tempdir().unwrap();
    let ge = FakeGe::new(dir.path(), true, "echo 'cannot reach qmaster' >&2\nexit 1");
    let (mut store, task) = setup(dir.path());
    let mut mgr = GridEngineJobManager::new(&ge.settings(dir.path())).unwrap();

    submit(&mut mgr, &mut store, &task, "true").unwrap();
    assert!(mgr
        .next_completed(Some(Duration::from_millis(100)))
        .unwrap()
        .is_none());
    assert_eq!(mgr.queued_count(), 1);
}

#[test]
fn test_rejected_submission() {
    let dir = tempdir().unwrap();
    let ge = FakeGe::new(dir.path(), false, QSTAT_EMPTY);
    FakeGe::script(
        &ge.bin.join("qsub"),
        "#!/bin/sh\necho 'Unable to run job: no suitable queues' >&2\nexit 1\n",
    );
    let (mut store, task) = setup(dir.path());
    let mut mgr = GridEngineJobManager::new(&ge.settings(dir.path())).unwrap();

    let err = submit(&mut mgr, &mut store, &task, "true").unwrap_err();
    assert!(err.is_submission());
    assert!(err.to_string().contains("no suitable queues"));
    assert_eq!(mgr.queued_count(), 0);
}
