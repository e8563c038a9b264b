//! End-to-end pool scenarios: pre-fill, exhaustion, leak reporting and
//! validation failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use reservoir_pool::{
    BoxError, ConnectionFactory, DestroyReason, Error, HandleId, Owner, Pool, PoolConfig,
    PoolEvent, PoolListener, PrefillMode, State,
};

// ---------------------------------------------------------------------------
// Test factory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TestFactory {
    next: AtomicU32,
    healthy: AtomicBool,
    closed: AtomicUsize,
}

impl TestFactory {
    fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ..Self::default()
        }
    }
}

impl ConnectionFactory for TestFactory {
    type Connection = u32;

    fn create(&self) -> Result<u32, BoxError> {
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn is_valid(&self, _connection: &mut u32) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn close(&self, _connection: u32) -> Result<(), BoxError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Background sweeps off; tests drive them explicitly unless they opt in.
fn quiet(name: &str) -> PoolConfig {
    PoolConfig::named(name)
        .with_validation_interval(Duration::ZERO)
        .with_reap_idle_timeout(Duration::ZERO)
}

fn settle<F: ConnectionFactory>(pool: &Pool<F>) {
    assert!(pool.wait_for_prefill(Duration::from_secs(5)), "pre-fill did not settle");
}

// ---------------------------------------------------------------------------
// Pre-fill
// ---------------------------------------------------------------------------

#[test]
fn prefill_to_min_leaves_everything_available() {
    let pool = Pool::new(TestFactory::new(), quiet("prefill").with_size(5, 10)).unwrap();
    settle(&pool);

    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.available_count(), 5);
    assert_eq!(pool.size(), 5);
    assert!(pool.handles().iter().all(|h| h.state == State::CheckedIn));
}

#[test]
fn prefill_to_max_and_none() {
    let full = Pool::new(
        TestFactory::new(),
        quiet("full").with_size(2, 4).with_prefill(PrefillMode::ToMax),
    )
    .unwrap();
    settle(&full);
    assert_eq!(full.available_count(), 4);

    let lazy = Pool::new(
        TestFactory::new(),
        quiet("lazy").with_size(2, 4).with_prefill(PrefillMode::None),
    )
    .unwrap();
    settle(&lazy);
    assert_eq!(lazy.size(), 0);
    let _conn = lazy.acquire().unwrap();
    assert_eq!(lazy.active_count(), 1);
}

// ---------------------------------------------------------------------------
// Exhaustion
// ---------------------------------------------------------------------------

#[test]
fn exhausted_pool_times_out_after_the_deadline() {
    let pool = Pool::new(TestFactory::new(), quiet("exhausted").with_size(0, 10)).unwrap();
    let held: Vec<_> = (0..10).map(|_| pool.acquire().unwrap()).collect();
    assert_eq!(pool.active_count(), 10);

    let started = Instant::now();
    let err = pool.acquire_timeout(Duration::from_secs(1)).unwrap_err();
    let waited = started.elapsed();

    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(waited >= Duration::from_secs(1), "gave up early: {waited:?}");
    assert!(waited < Duration::from_millis(1_150), "gave up late: {waited:?}");
    assert_eq!(pool.size(), 10);
    assert_eq!(pool.stats().timeouts, 1);
    match err {
        Error::AcquireTimeout {
            active, max_size, ..
        } => {
            assert_eq!(active, 10);
            assert_eq!(max_size, 10);
        }
        other => panic!("expected AcquireTimeout, got {other:?}"),
    }
    drop(held);
}

#[test]
fn waiter_is_served_by_a_return() {
    let pool = Pool::new(TestFactory::new(), quiet("handback").with_size(1, 1)).unwrap();
    settle(&pool);
    let conn = pool.acquire().unwrap();
    let id = conn.id();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| pool.acquire_timeout(Duration::from_secs(5)).map(|c| c.id()));
        std::thread::sleep(Duration::from_millis(50));
        drop(conn);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    });
}

#[test]
fn closing_fails_blocked_acquirers() {
    let pool = Pool::new(TestFactory::new(), quiet("closing").with_size(1, 1)).unwrap();
    settle(&pool);
    let conn = pool.acquire().unwrap();

    std::thread::scope(|s| {
        let waiter = s.spawn(|| pool.acquire_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(50));
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Closed { .. })));
    });

    // Checked-out connections are closed when their guard comes back.
    assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 0);
    drop(conn);
    assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.size(), 0);
}

// ---------------------------------------------------------------------------
// Leak detection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LeakCounter {
    leaks: AtomicUsize,
    with_owner: AtomicUsize,
}

impl PoolListener for LeakCounter {
    fn on_leak(&self, _pool: &str, _handle: HandleId, owner: Option<&Owner>, _held: Duration) {
        self.leaks.fetch_add(1, Ordering::SeqCst);
        if owner.is_some_and(|o| o.location.file().ends_with("pool_scenarios.rs")) {
            self.with_owner.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn held_connection_is_reported_once_per_sweep() {
    let counter = Arc::new(LeakCounter::default());
    let pool = Pool::builder(TestFactory::new())
        .config(
            quiet("leaky")
                .with_size(1, 2)
                .with_leak_timeout(Duration::from_millis(50))
                .with_leak_sweep_interval(Duration::from_secs(3600)),
        )
        .listener(counter.clone())
        .build()
        .unwrap();
    settle(&pool);

    let mut conn = pool.acquire().unwrap();
    assert_eq!(pool.run_leak_detection(), 0);

    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(pool.run_leak_detection(), 1);
    assert_eq!(pool.run_leak_detection(), 1);
    assert_eq!(counter.leaks.load(Ordering::SeqCst), 2);
    assert_eq!(counter.with_owner.load(Ordering::SeqCst), 2);

    // Still usable and still checked out.
    *conn += 100;
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.stats().destroyed, 0);

    drop(conn);
    assert_eq!(pool.run_leak_detection(), 0);
    assert_eq!(pool.stats().leaks_suspected, 2);
}

#[test]
fn scheduled_leak_sweep_reports_repeatedly() {
    let counter = Arc::new(LeakCounter::default());
    let pool = Pool::builder(TestFactory::new())
        .config(quiet("leak-timer").with_leak_timeout(Duration::from_millis(30)))
        .listener(counter.clone())
        .build()
        .unwrap();
    let _conn = pool.acquire().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while counter.leaks.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(counter.leaks.load(Ordering::SeqCst) >= 2);
    assert_eq!(pool.active_count(), 1);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn failed_validation_destroys_and_replaces() {
    let pool = Pool::new(TestFactory::new(), quiet("validate").with_size(2, 4)).unwrap();
    settle(&pool);
    let mut events = pool.subscribe();
    let before: Vec<_> = pool.handles().into_iter().map(|h| h.id).collect();

    assert_eq!(pool.run_validation(), 2);
    assert_eq!(pool.stats().validation_failures, 0);

    pool.factory().healthy.store(false, Ordering::SeqCst);
    assert_eq!(pool.run_validation(), 2);
    pool.factory().healthy.store(true, Ordering::SeqCst);
    settle(&pool);

    let stats = pool.stats();
    assert_eq!(stats.validation_failures, 2);
    assert_eq!(stats.destroyed, 2);
    assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.size(), 2);
    let after: Vec<_> = pool.handles().into_iter().map(|h| h.id).collect();
    assert!(after.iter().all(|id| !before.contains(id)));

    let mut reasons = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::Destroyed { reason, .. } = event {
            reasons.push(reason);
        }
    }
    assert_eq!(reasons, vec![DestroyReason::ValidationFailed; 2]);

    // Replacements are usable up to max_size.
    let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    assert_eq!(held.len(), 4);
}

#[test]
fn scheduled_validation_removes_bad_connections() {
    let factory = TestFactory::new();
    factory.healthy.store(false, Ordering::SeqCst);
    let pool = Pool::new(
        factory,
        quiet("validate-timer")
            .with_size(1, 1)
            .with_validation_interval(Duration::from_millis(20)),
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.stats().validation_failures == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(pool.stats().validation_failures >= 1);
    assert!(pool.stats().destroyed >= 1);
    assert!(pool.size() <= 1);
}

#[test]
fn validation_skips_checked_out_connections() {
    let pool = Pool::new(TestFactory::new(), quiet("busy").with_size(2, 2)).unwrap();
    settle(&pool);
    let _conn = pool.acquire().unwrap();
    pool.factory().healthy.store(false, Ordering::SeqCst);
    assert_eq!(pool.run_validation(), 1);
    assert_eq!(pool.active_count(), 1);
}

// ---------------------------------------------------------------------------
// Reaping
// ---------------------------------------------------------------------------

#[test]
fn reaping_never_goes_below_min() {
    let pool = Pool::new(
        TestFactory::new(),
        quiet("reap")
            .with_size(2, 5)
            .with_reap_idle_timeout(Duration::from_millis(30))
            .with_reap_sweep_interval(Duration::from_secs(3600)),
    )
    .unwrap();
    settle(&pool);

    let held: Vec<_> = (0..5).map(|_| pool.acquire().unwrap()).collect();
    assert_eq!(pool.size(), 5);
    drop(held);

    assert_eq!(pool.run_reap(), 0);
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(pool.run_reap(), 3);
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.available_count(), 2);
    assert_eq!(pool.stats().reaped, 3);

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(pool.run_reap(), 0);
    assert_eq!(pool.size(), 2);
}

#[test]
fn lowering_min_lets_the_reaper_shrink() {
    let pool = Pool::new(
        TestFactory::new(),
        quiet("shrink")
            .with_size(3, 3)
            .with_reap_idle_timeout(Duration::from_millis(10))
            .with_reap_sweep_interval(Duration::from_secs(3600)),
    )
    .unwrap();
    settle(&pool);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(pool.run_reap(), 0);

    pool.set_min_size(1).unwrap();
    assert_eq!(pool.run_reap(), 2);
    assert_eq!(pool.size(), 1);
}

#[test]
fn closing_mid_reap_closes_every_connection() {
    for _ in 0..20 {
        let pool = Pool::new(
            TestFactory::new(),
            quiet("reap-close")
                .with_size(0, 32)
                .with_prefill(PrefillMode::ToMax)
                .with_reap_idle_timeout(Duration::from_millis(1))
                .with_reap_sweep_interval(Duration::from_millis(5)),
        )
        .unwrap();
        settle(&pool);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.size() == 32
            && pool.handles().iter().all(|h| h.state != State::ToDestroy)
            && Instant::now() < deadline
        {
            std::hint::spin_loop();
        }
        pool.close();

        // Reap steps already running finish on their own threads.
        let deadline = Instant::now() + Duration::from_secs(2);
        while (!pool.handles().is_empty() || pool.size() != 0) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let stranded: Vec<_> = pool.handles().into_iter().map(|h| h.state).collect();
        assert!(stranded.is_empty(), "left behind after close: {stranded:?}");
        let factory = pool.factory();
        assert_eq!(
            factory.closed.load(Ordering::SeqCst),
            factory.next.load(Ordering::SeqCst) as usize
        );
        assert_eq!(pool.size(), 0);
    }
}
