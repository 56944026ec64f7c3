use asynchrormous::error::QueryError;
use asynchrormous::scheduler::Job;
use asynchrormous::{
    AsyncQuerySet, Backend, Filter, InlineScheduler, Manager, MemoryBackend, QueryResult,
    QuerySpec, Scheduler, TaskKind, ThreadScheduler, Value,
};
use std::sync::Arc;
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

fn populated(rows: i64) -> (Arc<MemoryBackend>, Manager<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    for x in 0..rows {
        backend.insert("async_model", [("field1", Value::from(x % 2))]);
    }
    backend.set_latency(Some(Duration::from_millis(10)));
    let manager = Manager::new(backend.clone(), "async_model")
        .with_scheduler(Arc::new(ThreadScheduler::new()));
    (backend, manager)
}

fn expect_connection(err: &QueryError, expected: &str) {
    match err {
        QueryError::Connection { message } => assert_eq!(message, expected),
        other => panic!("expected connection error, got {other:?}"),
    }
}

#[test]
fn failed_background_fetch_is_raised_on_iteration() {
    init_tracing();
    let (backend, objects) = populated(1000);

    backend.fail_next("connection reset");
    let qs = objects.filter(Filter::exact("field1", 0));
    qs.start_fetch();

    let err = qs.iter().unwrap_err();
    expect_connection(&err, "connection reset");

    // Same error on every later join; no silent empty result.
    let again = qs.to_vec().unwrap_err();
    assert!(Arc::ptr_eq(&err, &again));
    assert!(qs.cached_rows().is_none());
}

#[test]
fn background_and_synchronous_failures_share_a_category() {
    init_tracing();
    let (backend, objects) = populated(10);

    backend.fail_next("server closed the connection");
    let sync_err = objects.all().fetch_all().unwrap_err();

    backend.fail_next("server closed the connection");
    let qs = objects.all();
    let async_err = qs.start_fetch().fetch_all().unwrap_err();

    assert_eq!(sync_err.to_string(), async_err.to_string());
    expect_connection(&async_err, "server closed the connection");
}

#[test]
fn failed_fetch_task_fails_count_and_exists() {
    init_tracing();
    let (backend, objects) = populated(10);

    backend.fail_next("timeout");
    let qs = objects.all();
    qs.start_fetch();

    expect_connection(&qs.count().unwrap_err(), "timeout");
    expect_connection(&qs.exists().unwrap_err(), "timeout");
}

#[test]
fn failed_count_task_fails_count_and_exists() {
    init_tracing();
    let (backend, objects) = populated(10);

    backend.fail_next("broken pipe");
    let qs = objects.all();
    qs.start_count();

    expect_connection(&qs.count().unwrap_err(), "broken pipe");
    expect_connection(&qs.exists().unwrap_err(), "broken pipe");
    assert_eq!(backend.round_trips().count, 1);
}

#[test]
fn failed_exists_task_fails_exists() {
    init_tracing();
    let (backend, objects) = populated(10);

    backend.fail_always("unreachable");
    let qs = objects.all();
    qs.start_exists();
    expect_connection(&qs.exists().unwrap_err(), "unreachable");

    backend.clear_failure();
    // Count has its own slot and path, unaffected by the failed existence task.
    assert_eq!(qs.count().unwrap(), 10);
}

#[test]
fn unknown_model_is_a_query_error() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let qs = Manager::new(backend, "missing")
        .with_scheduler(Arc::new(InlineScheduler))
        .all();

    let err = qs.start_count().count().unwrap_err();
    assert!(matches!(&*err, QueryError::Query { .. }), "got {err:?}");
}

struct PanickingBackend;

impl Backend for PanickingBackend {
    type Row = u32;

    fn fetch_all(&self, _spec: &QuerySpec) -> QueryResult<Vec<u32>> {
        panic!("boom");
    }

    fn count(&self, _spec: &QuerySpec) -> QueryResult<u64> {
        Ok(0)
    }

    fn exists(&self, _spec: &QuerySpec) -> QueryResult<bool> {
        Ok(false)
    }
}

#[test]
fn panicking_task_is_reported_at_join() {
    init_tracing();
    let qs = AsyncQuerySet::new(Arc::new(PanickingBackend), QuerySpec::new("anything"))
        .with_scheduler(Arc::new(InlineScheduler));

    qs.start_fetch();
    let err = qs.fetch_all().unwrap_err();
    match &*err {
        QueryError::Panic { task, message } => {
            assert_eq!(*task, TaskKind::Fetch);
            assert_eq!(message, "boom");
        }
        other => panic!("expected panic error, got {other:?}"),
    }
}

struct RefusingScheduler;

impl Scheduler for RefusingScheduler {
    fn name(&self) -> &'static str {
        "refusing"
    }

    fn execute(&self, _job: Job) -> std::io::Result<()> {
        Err(std::io::Error::other("no threads left"))
    }
}

#[test]
fn scheduler_failure_is_reported_at_join() {
    init_tracing();
    let (backend, objects) = populated(10);
    let qs = objects.all().with_scheduler(Arc::new(RefusingScheduler));

    qs.start_count();
    let err = qs.count().unwrap_err();
    match &*err {
        QueryError::Spawn {
            task,
            scheduler,
            message,
        } => {
            assert_eq!(*task, TaskKind::Count);
            assert_eq!(*scheduler, "refusing");
            assert_eq!(message, "no threads left");
        }
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert_eq!(backend.round_trips().count, 0);
}

/// Runs the job, then reports failure anyway.
struct RunThenRefuseScheduler;

impl Scheduler for RunThenRefuseScheduler {
    fn name(&self) -> &'static str {
        "run-then-refuse"
    }

    fn execute(&self, job: Job) -> std::io::Result<()> {
        job();
        Err(std::io::Error::other("refused after running"))
    }
}

#[test]
fn job_outcome_survives_a_late_scheduler_error() {
    init_tracing();
    let (backend, objects) = populated(10);

    backend.fail_next("lost connection");
    let qs = objects.all().with_scheduler(Arc::new(RunThenRefuseScheduler));
    qs.start_count();
    expect_connection(&qs.count().unwrap_err(), "lost connection");

    let qs = objects.all().with_scheduler(Arc::new(RunThenRefuseScheduler));
    qs.start_exists();
    assert!(qs.exists_task().unwrap().join().is_ok());
    assert!(qs.exists().unwrap());
    assert_eq!(backend.round_trips().count, 1);
    assert_eq!(backend.round_trips().exists, 1);
}

struct DroppingScheduler;

impl Scheduler for DroppingScheduler {
    fn name(&self) -> &'static str {
        "dropping"
    }

    fn execute(&self, job: Job) -> std::io::Result<()> {
        drop(job);
        Ok(())
    }
}

#[test]
fn dropped_job_is_reported_as_abandoned() {
    init_tracing();
    let (_backend, objects) = populated(10);
    let qs = objects.all().with_scheduler(Arc::new(DroppingScheduler));

    qs.start_exists();
    assert!(qs.exists_task().unwrap().is_finished());
    let err = qs.exists().unwrap_err();
    assert!(
        matches!(
            &*err,
            QueryError::Abandoned {
                task: TaskKind::Exists,
                scheduler: "dropping"
            }
        ),
        "got {err:?}"
    );
}

#[test]
fn get_reports_missing_and_duplicate_rows() {
    init_tracing();
    let (_backend, objects) = populated(100);

    let err = objects.get([Filter::exact("field1", 7)]).unwrap_err();
    assert!(matches!(&*err, QueryError::DoesNotExist { model } if model == "async_model"));

    let err = objects.get([Filter::exact("field1", 1)]).unwrap_err();
    match &*err {
        QueryError::MultipleObjectsReturned { found, .. } => assert_eq!(found, "more than 20"),
        other => panic!("expected multiple objects error, got {other:?}"),
    }

    let err = objects
        .filter(Filter::exact("field1", 1))
        .limit(3)
        .get(Vec::<Filter>::new())
        .unwrap_err();
    match &*err {
        QueryError::MultipleObjectsReturned { found, .. } => assert_eq!(found, "3"),
        other => panic!("expected multiple objects error, got {other:?}"),
    }
}
