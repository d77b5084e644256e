use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use weft_core::config::Settings;
use weft_core::model::{JobAttempt, QueueStatus, Resources, TagSet, Task};
use weft_core::store::{
    AttemptRepository, NewTask, NewWorkflow, StageRepository, Store, TaskBatch, TaskRepository,
    WorkflowRepository,
};
use weft_executor::{ExecutorError, JobManager, JobRequest, LocalJobManager};

fn setup(root: &Path, samples: &[&str]) -> (Store, Vec<Task>) {
    let mut store = Store::in_memory();
    let wf = store
        .create_workflow(NewWorkflow {
            name: "local".into(),
            output_dir: root.join("out"),
            dry_run: false,
            max_cores: 0,
            max_reattempts: 0,
            terminate_on_failure: true,
            delete_intermediates: false,
            default_queue: None,
        })
        .unwrap();
    let stage = store.get_or_create_stage(wf.id, "echo", 0).unwrap();
    let mut batch = TaskBatch::new();
    for s in samples {
        batch.push(NewTask {
            stage_id: stage.id,
            tags: TagSet::from_pairs([("sample", *s)]),
            command: String::new(),
            resources: Resources::default(),
            noop: false,
            succeed_on_failure: false,
            output_dir: root.join("out").join(s),
            outputs: vec![],
            input_files: vec![],
            parents: vec![],
        });
    }
    let tasks = store.insert_tasks(batch).unwrap();
    for t in &tasks {
        fs::create_dir_all(&t.output_dir).unwrap();
    }
    (store, tasks)
}

fn manager(root: &Path) -> LocalJobManager {
    let mut settings = Settings::for_root(root);
    settings.poll_interval = Duration::from_millis(10);
    LocalJobManager::new(&settings)
}

fn submit(
    mgr: &mut LocalJobManager,
    store: &mut Store,
    task: &Task,
    command: &str,
) -> Result<JobAttempt, ExecutorError> {
    let attempt = store.create_attempt(task.id).unwrap();
    mgr.submit(JobRequest {
        task,
        stage_name: "echo",
        attempt,
        command: command.to_string(),
    })
}

fn wait_one(mgr: &mut LocalJobManager) -> JobAttempt {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if let Some(done) = mgr.next_completed(Some(Duration::from_millis(200))).unwrap() {
            return done;
        }
    }
    panic!("no job completed in time");
}

#[test]
fn test_successful_job_writes_logs_and_marker() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1"]);
    let mut mgr = manager(dir.path());

    let queued = submit(&mut mgr, &mut store, &tasks[0], "echo hello\necho oops >&2").unwrap();
    assert_eq!(queued.queue_status, QueueStatus::Queued);
    assert!(queued.drm_job_id.is_some());
    assert_eq!(mgr.queued_count(), 1);

    let done = wait_one(&mut mgr);
    assert_eq!(done.id, queued.id);
    assert!(done.successful);
    assert_eq!(done.exit_status, Some(0));
    assert_eq!(done.queue_status, QueueStatus::Completed);
    assert!(done.usage.is_none(), "no sampler configured");
    assert_eq!(fs::read_to_string(&done.stdout_path).unwrap(), "hello\n");
    assert_eq!(fs::read_to_string(&done.stderr_path).unwrap(), "oops\n");
    assert_eq!(mgr.queued_count(), 0);
}

#[test]
fn test_failed_job_reports_exit_code() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1"]);
    let mut mgr = manager(dir.path());

    submit(&mut mgr, &mut store, &tasks[0], "exit 3").unwrap();
    let done = wait_one(&mut mgr);
    assert!(!done.successful);
    assert_eq!(done.exit_status, Some(3));
    let marker = tasks[0].job_info_dir().join("exit_code");
    assert_eq!(fs::read_to_string(marker).unwrap().trim(), "3");
}

#[test]
fn test_second_submission_of_queued_task_is_rejected() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1"]);
    let mut mgr = manager(dir.path());

    let first = submit(&mut mgr, &mut store, &tasks[0], "sleep 5").unwrap();
    let err = submit(&mut mgr, &mut store, &tasks[0], "true").unwrap_err();
    assert!(matches!(err, ExecutorError::AlreadyQueued(id) if id == tasks[0].id));
    assert!(err.is_submission());
    assert_eq!(mgr.queued_count(), 1);

    mgr.terminate(first.id);
    assert_eq!(mgr.queued_count(), 0);
}

#[test]
fn test_next_completed_times_out_while_jobs_pending() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1"]);
    let mut mgr = manager(dir.path());

    assert!(mgr.next_completed(Some(Duration::ZERO)).unwrap().is_none());

    let queued = submit(&mut mgr, &mut store, &tasks[0], "sleep 5").unwrap();
    let started = Instant::now();
    assert!(mgr
        .next_completed(Some(Duration::from_millis(100)))
        .unwrap()
        .is_none());
    assert!(started.elapsed() < Duration::from_secs(4));
    mgr.terminate(queued.id);
}

#[test]
fn test_terminate_reaches_the_whole_process_group() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1"]);
    let mut mgr = manager(dir.path());
    let flag = dir.path().join("survived");

    let command = format!("(sleep 1; touch '{}') &\nwait", flag.display());
    let queued = submit(&mut mgr, &mut store, &tasks[0], &command).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    mgr.terminate(queued.id);

    std::thread::sleep(Duration::from_millis(1500));
    assert!(!flag.exists(), "grandchild should have been terminated");
}

#[test]
fn test_sampler_report_is_attached() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1"]);

    // Stand-in sampler: writes a report then runs the command after `--`.
    let sampler = dir.path().join("sampler.sh");
    fs::write(
        &sampler,
        "#!/bin/sh\nreport=$2\nshift 3\necho '{\"wall_time\": 1.5, \"max_rss_kb\": 2048}' > \"$report\"\nexec \"$@\"\n",
    )
    .unwrap();
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(&sampler, fs::Permissions::from_mode(0o755)).unwrap();

    let mut settings = Settings::for_root(dir.path());
    settings.poll_interval = Duration::from_millis(10);
    settings.sampler = Some(sampler.display().to_string());
    let mut mgr = LocalJobManager::new(&settings);

    let attempt = store.create_attempt(tasks[0].id).unwrap();
    mgr.submit(JobRequest {
        task: &tasks[0],
        stage_name: "echo",
        attempt,
        command: "echo sampled".into(),
    })
    .unwrap();
    let done = wait_one(&mut mgr);
    assert!(done.successful);
    let usage = done.usage.unwrap();
    assert_eq!(usage.wall_time, Some(1.5));
    assert_eq!(usage.max_rss_kb, Some(2048));
    assert_eq!(fs::read_to_string(&done.stdout_path).unwrap(), "sampled\n");
}

#[test]
fn test_independent_tasks_run_concurrently() {
    let dir = tempdir().unwrap();
    let (mut store, tasks) = setup(dir.path(), &["s1", "s2", "s3"]);
    let mut mgr = manager(dir.path());

    for t in &tasks {
        submit(&mut mgr, &mut store, t, "sleep 0.3").unwrap();
    }
    assert_eq!(mgr.queued_count(), 3);

    let started = Instant::now();
    let mut finished = Vec::new();
    for _ in 0..3 {
        finished.push(wait_one(&mut mgr).task_id);
    }
    finished.sort();
    let mut expected: Vec<_> = tasks.iter().map(|t| t.id).collect();
    expected.sort();
    assert_eq!(finished, expected);
    assert!(started.elapsed() < Duration::from_secs(5));
}
