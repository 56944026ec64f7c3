use asynchrormous::scheduler::{SCHEDULER_ENV, STACK_SIZE_ENV, THREAD_NAME_ENV};
use asynchrormous::task;
use asynchrormous::{
    Filter, InlineScheduler, Manager, MemoryBackend, Scheduler, SchedulerConfig, SchedulerKind,
    TaskKind, ThreadScheduler, TokioScheduler, Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

fn init_tracing() {
    static ONCE: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    ONCE.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    });
}

fn config_from(vars: &[(&str, &str)]) -> SchedulerConfig {
    let env: HashMap<&str, String> = vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
    SchedulerConfig::from_lookup(|name| env.get(name).cloned())
}

#[test]
fn config_defaults_without_environment() {
    let config = config_from(&[]);
    assert_eq!(config, SchedulerConfig::default());
    assert_eq!(config.kind, SchedulerKind::Thread);
    assert_eq!(config.thread_name, "asynchrormous-task");
    assert_eq!(config.stack_size, None);
}

#[test]
fn config_reads_environment() {
    let config = config_from(&[
        (SCHEDULER_ENV, "Inline"),
        (STACK_SIZE_ENV, "262144"),
        (THREAD_NAME_ENV, "qs-worker"),
    ]);
    assert_eq!(config.kind, SchedulerKind::Inline);
    assert_eq!(config.stack_size, Some(262_144));
    assert_eq!(config.thread_name, "qs-worker");
    assert_eq!(config.build().name(), "inline");
}

#[test]
fn config_ignores_invalid_values() {
    init_tracing();
    let config = config_from(&[(SCHEDULER_ENV, "fibers"), (STACK_SIZE_ENV, "lots")]);
    assert_eq!(config.kind, SchedulerKind::Thread);
    assert_eq!(config.stack_size, None);
}

#[test]
fn tokio_config_outside_runtime_falls_back_to_threads() {
    init_tracing();
    let config = config_from(&[(SCHEDULER_ENV, "tokio")]);
    assert_eq!(config.build().name(), "thread");
}

#[test]
fn thread_scheduler_names_its_threads() {
    let config = config_from(&[(THREAD_NAME_ENV, "qs-worker")]);
    let scheduler = ThreadScheduler::from_config(&config);

    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        scheduler
            .execute(Box::new(move || {
                let name = std::thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            }))
            .unwrap();
    }

    let mut names: Vec<_> = (0..2).map(|_| rx.recv().unwrap().unwrap()).collect();
    names.sort();
    assert_eq!(names, ["qs-worker-0", "qs-worker-1"]);
    assert_eq!(scheduler.spawned(), 2);
}

#[test]
fn inline_scheduler_finishes_before_returning() {
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_for_job = runs.clone();
    let handle = task::spawn(&InlineScheduler, TaskKind::Count, move || {
        runs_for_job.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert!(handle.is_finished());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    handle.join().unwrap();
    handle.join().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn join_blocks_until_the_job_finishes() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = task::spawn(&ThreadScheduler::new(), TaskKind::Fetch, move || {
        release_rx.recv().unwrap();
        Ok(())
    });

    assert!(!handle.is_finished());
    assert_eq!(handle.kind(), TaskKind::Fetch);
    let joiner = {
        let handle = handle.clone();
        std::thread::spawn(move || handle.join())
    };
    std::thread::sleep(Duration::from_millis(20));
    assert!(!joiner.is_finished());

    release_tx.send(()).unwrap();
    joiner.join().unwrap().unwrap();
    assert!(handle.is_finished());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokio_scheduler_runs_on_the_blocking_pool() {
    init_tracing();

    let backend = Arc::new(MemoryBackend::new());
    for x in 0..100i64 {
        backend.insert("async_model", [("field1", Value::from(x % 2))]);
    }
    backend.set_latency(Some(Duration::from_millis(20)));

    let scheduler = TokioScheduler::current().expect("inside a runtime");
    let objects = Manager::new(backend.clone(), "async_model").with_scheduler(Arc::new(scheduler));

    let qs = objects.filter(Filter::exact("field1", 1));
    qs.start_fetch().start_count();

    qs.fetch_task().unwrap().wait().await.unwrap();
    qs.count_task().unwrap().wait().await.unwrap();

    assert_eq!(qs.cached_rows().map(|rows| rows.len()), Some(50));
    assert_eq!(qs.cached_count(), Some(50));
    assert_eq!(qs.count().unwrap(), 50);
    assert_eq!(backend.round_trips().fetch, 1);
    assert_eq!(backend.round_trips().count, 1);
}

#[tokio::test]
async fn wait_reports_background_errors() {
    init_tracing();

    let backend = Arc::new(MemoryBackend::new());
    backend.create_table("async_model");
    backend.fail_next("connection refused");

    let objects = Manager::new(backend, "async_model")
        .with_scheduler(Arc::new(ThreadScheduler::new()));
    let qs = objects.all();
    qs.start_exists();

    let err = qs.exists_task().unwrap().wait().await.unwrap_err();
    assert_eq!(err.to_string(), "connection error: connection refused");
}
