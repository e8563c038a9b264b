//! Listener isolation, event delivery and factory failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use reservoir_pool::{
    BoxError, ConnectionFactory, DestroyReason, Error, FactoryError, FnFactory, HandleId, Pool,
    PoolConfig, PoolEvent, PoolListener, PrefillMode, TracingListener,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn quiet(name: &str) -> PoolConfig {
    PoolConfig::named(name)
        .with_validation_interval(Duration::ZERO)
        .with_reap_idle_timeout(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

struct Panicking;

impl PoolListener for Panicking {
    fn before_acquire(&self, _pool: &str) {
        panic!("listener bug");
    }

    fn after_return(&self, _pool: &str, _handle: HandleId, _held: Duration) {
        panic!("listener bug");
    }
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<&'static str>>,
    closes: AtomicUsize,
    warnings: Mutex<Vec<String>>,
}

impl PoolListener for Recorder {
    fn before_create(&self, _pool: &str) {
        self.calls.lock().push("before_create");
    }

    fn after_create(&self, _pool: &str, result: Result<HandleId, FactoryError<'_>>, _elapsed: Duration) {
        self.calls
            .lock()
            .push(if result.is_ok() { "created" } else { "create_failed" });
    }

    fn before_acquire(&self, _pool: &str) {
        self.calls.lock().push("before_acquire");
    }

    fn after_acquire(&self, _pool: &str, result: Result<HandleId, &Error>, _waited: Duration) {
        self.calls
            .lock()
            .push(if result.is_ok() { "acquired" } else { "acquire_failed" });
    }

    fn after_return(&self, _pool: &str, _handle: HandleId, _held: Duration) {
        self.calls.lock().push("returned");
    }

    fn on_close(&self, _pool: &str, _handle: HandleId, _result: Result<(), FactoryError<'_>>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_warning(&self, _pool: &str, message: &str) {
        self.warnings.lock().push(message.to_string());
    }
}

#[test]
fn panicking_listener_does_not_disturb_the_pool() {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let pool = Pool::builder(FnFactory::new(|| Ok::<_, BoxError>(1u8)))
        .config(quiet("isolated").with_size(1, 1))
        .listener(Arc::new(Panicking))
        .listener(recorder.clone())
        .listener(Arc::new(TracingListener))
        .build()
        .unwrap();
    assert!(pool.wait_for_prefill(Duration::from_secs(5)));

    let conn = pool.acquire().unwrap();
    drop(conn);

    assert_eq!(
        *recorder.calls.lock(),
        vec!["before_create", "created", "before_acquire", "acquired", "returned"]
    );
    assert_eq!(pool.available_count(), 1);
}

#[test]
fn timeouts_and_shutdown_reach_listeners() {
    let recorder = Arc::new(Recorder::default());
    let pool = Pool::builder(FnFactory::new(|| Ok::<_, BoxError>(1u8)))
        .config(quiet("observed").with_size(2, 2))
        .listener(recorder.clone())
        .build()
        .unwrap();
    assert!(pool.wait_for_prefill(Duration::from_secs(5)));

    let held: Vec<_> = (0..2).map(|_| pool.acquire().unwrap()).collect();
    assert!(pool.acquire_timeout(Duration::from_millis(20)).is_err());
    assert_eq!(recorder.calls.lock().last(), Some(&"acquire_failed"));

    drop(held);
    pool.close();
    assert_eq!(recorder.closes.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[test]
fn events_follow_the_connection_lifecycle() {
    let pool = Pool::new(
        FnFactory::new(|| Ok::<_, BoxError>(1u8)),
        quiet("evented").with_size(0, 1),
    )
    .unwrap();
    let mut events = pool.subscribe();

    let conn = pool.acquire().unwrap();
    let id = conn.id();
    conn.invalidate();
    assert!(pool.wait_for_prefill(Duration::from_secs(5)));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.pool(), "evented");
        seen.push(event);
    }
    assert!(matches!(seen[0], PoolEvent::Created { handle, .. } if handle == id));
    assert!(matches!(seen[1], PoolEvent::Acquired { handle, .. } if handle == id));
    assert!(matches!(
        seen[2],
        PoolEvent::Destroyed {
            handle,
            reason: DestroyReason::Invalidated,
            ..
        } if handle == id
    ));
    assert_eq!(seen.len(), 3);
}

// ---------------------------------------------------------------------------
// Factory failures
// ---------------------------------------------------------------------------

struct Flaky {
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl ConnectionFactory for Flaky {
    type Connection = usize;

    fn create(&self) -> Result<usize, BoxError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(format!("connection refused (attempt {attempt})").into());
        }
        Ok(attempt)
    }
}

#[test]
fn caller_sees_the_creation_error_it_triggered() {
    let pool = Pool::new(
        Flaky {
            failing: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        },
        quiet("flaky").with_size(0, 2).with_prefill(PrefillMode::None),
    )
    .unwrap();

    let err = pool.acquire_timeout(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, Error::Creation { .. }), "unexpected: {err}");
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.stats().creation_failures, 1);

    pool.factory().failing.store(false, Ordering::SeqCst);
    let conn = pool.acquire().unwrap();
    assert_eq!(*conn, 1);
}

#[test]
fn failed_background_creation_is_a_warning() {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let pool = Pool::builder(Flaky {
        failing: AtomicBool::new(true),
        attempts: AtomicUsize::new(0),
    })
    .config(quiet("prefill-fails").with_size(2, 2))
    .listener(recorder.clone())
    .build()
    .unwrap();
    assert!(pool.wait_for_prefill(Duration::from_secs(5)));

    assert_eq!(pool.size(), 0);
    assert_eq!(pool.stats().creation_failures, 2);
    let warnings = recorder.warnings.lock();
    assert_eq!(warnings.len(), 2);
    assert!(warnings.iter().all(|w| w.contains("connection refused")));
}

#[test]
fn panicking_factory_is_reported_as_a_creation_failure() {
    let pool = Pool::new(
        FnFactory::new(|| -> Result<u8, BoxError> { panic!("driver crashed") }),
        quiet("panicky").with_size(0, 1),
    )
    .unwrap();
    let err = pool.acquire_timeout(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, Error::Creation { .. }));
    assert_eq!(pool.size(), 0);
}

#[test]
fn invalid_configuration_is_rejected_up_front() {
    let err = Pool::new(
        FnFactory::new(|| Ok::<_, BoxError>(())),
        PoolConfig::named("bad").with_size(3, 1),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}
