//! Housekeeping: validation, leak detection and idle reaping.
//!
//! Each pool owns a small multi-thread tokio runtime. Three recurring sweeps
//! run on it, one interval timer each; a sweep picks its candidates from the
//! current snapshot of the handle collection and fans out one blocking task
//! per candidate, so a slow validator or a slow close never holds up the
//! timers. Every per-handle step goes through the same state CAS as the
//! foreground path and backs off when it loses.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::{Builder, Handle as RuntimeHandle, Runtime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{DestroyReason, PoolEvent};
use crate::factory::ConnectionFactory;
use crate::pool::{HandleRef, PoolInner};
use crate::state::State;
use crate::stats::Counters;

/// Which sweep to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sweep {
    Validation,
    Leak,
    Reap,
}

impl Sweep {
    fn name(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Leak => "leak",
            Self::Reap => "reap",
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The pool's background runtime and the token that stops its sweeps.
pub(crate) struct Scheduler {
    runtime: Runtime,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Build the runtime and start every sweep whose period is non-zero.
    ///
    /// Sweep tasks hold only a weak reference, so they never keep the pool
    /// alive.
    pub(crate) fn start<F: ConnectionFactory>(pool: &Arc<PoolInner<F>>) -> Result<Self> {
        let config = &pool.config;
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.housekeeping_threads)
            .thread_name(format!("{}-housekeeper", config.name))
            .enable_time()
            .build()
            .map_err(|source| Error::Scheduler {
                pool: config.name.clone(),
                source,
            })?;
        let cancel = CancellationToken::new();

        let sweeps = [
            (Sweep::Validation, config.validation_interval),
            (Sweep::Leak, config.leak_sweep_period()),
            (Sweep::Reap, config.reap_sweep_period()),
        ];
        for (sweep, period) in sweeps {
            if period.is_zero() {
                tracing::debug!(pool = %config.name, sweep = sweep.name(), "Sweep disabled");
                continue;
            }
            runtime.spawn(run_periodically(
                Arc::downgrade(pool),
                sweep,
                period,
                cancel.child_token(),
            ));
        }

        Ok(Self { runtime, cancel })
    }

    pub(crate) fn handle(&self) -> RuntimeHandle {
        self.runtime.handle().clone()
    }

    /// Stop the sweeps and release the runtime without waiting for blocking
    /// tasks still in flight.
    pub(crate) fn shutdown(self) {
        self.cancel.cancel();
        self.runtime.shutdown_background();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn run_periodically<F: ConnectionFactory>(
    pool: Weak<PoolInner<F>>,
    sweep: Sweep,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        if pool.is_closed() {
            break;
        }
        let candidates = pool.plan(sweep);
        tracing::trace!(
            pool = %pool.name,
            sweep = sweep.name(),
            candidates = candidates.len(),
            "Sweep tick"
        );
        for handle in candidates {
            let pool = Arc::downgrade(&pool);
            tokio::task::spawn_blocking(move || {
                if let Some(pool) = pool.upgrade() {
                    pool.execute(sweep, &handle);
                }
            });
        }
        if sweep != Sweep::Leak {
            pool.top_up();
        }
    }
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

impl<F: ConnectionFactory> PoolInner<F> {
    /// Pick the handles a sweep should act on.
    ///
    /// Planning claims nothing. Each candidate is claimed by its own
    /// [`execute`](Self::execute) step, so a step the runtime drops unrun
    /// leaves its handle as it was.
    pub(crate) fn plan(&self, sweep: Sweep) -> Vec<HandleRef<F>> {
        let snapshot = self.snapshot();
        match sweep {
            Sweep::Validation => snapshot
                .iter()
                .filter(|h| h.state() == State::CheckedIn)
                .cloned()
                .collect(),
            Sweep::Leak => {
                let threshold = self.config.leak_timeout;
                snapshot
                    .iter()
                    .filter(|h| h.state() == State::CheckedOut && h.idle_for() > threshold)
                    .cloned()
                    .collect()
            }
            Sweep::Reap => self.reap_candidates(&snapshot),
        }
    }

    /// Run one sweep's per-handle step.
    pub(crate) fn execute(self: &Arc<Self>, sweep: Sweep, handle: &HandleRef<F>) -> bool {
        match sweep {
            Sweep::Validation => self.validate(handle),
            Sweep::Leak => self.report_leak(handle),
            Sweep::Reap => self.reap(handle),
        }
    }

    /// Plan and execute a sweep on the calling thread.
    pub(crate) fn run_sweep_inline(self: &Arc<Self>, sweep: Sweep) -> usize {
        if self.is_closed() {
            return 0;
        }
        let done = self
            .plan(sweep)
            .iter()
            .filter(|handle| self.execute(sweep, handle))
            .count();
        if sweep != Sweep::Leak {
            self.top_up();
        }
        done
    }

    /// Probe one idle connection. Returns `false` if the handle was not idle.
    fn validate(self: &Arc<Self>, handle: &HandleRef<F>) -> bool {
        if !self.transition(handle, State::CheckedIn, State::Validation) {
            return false;
        }
        let id = handle.id();
        let valid = handle
            .with_connection(|connection| {
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    self.factory.is_valid(connection)
                }))
                .unwrap_or(false)
            })
            .unwrap_or(false);
        self.notify("on_validation", |l| l.on_validation(&self.name, id, valid));

        if valid {
            if self.transition(handle, State::Validation, State::CheckedIn) {
                self.publish(handle);
            }
            return true;
        }

        Counters::bump(&self.counters.validation_failures);
        tracing::warn!(pool = %self.name, handle = %id, "Connection failed validation");
        if self.transition(handle, State::Validation, State::ToDestroy) {
            self.destroy(handle, DestroyReason::ValidationFailed, false);
        }
        true
    }

    /// Report a connection held past the leak timeout. The handle is left
    /// untouched.
    fn report_leak(&self, handle: &HandleRef<F>) -> bool {
        if handle.state() != State::CheckedOut {
            return false;
        }
        let held = handle.idle_for();
        if held <= self.config.leak_timeout {
            return false;
        }
        let id = handle.id();
        let owner = handle.owner();
        Counters::bump(&self.counters.leaks_suspected);
        match &owner {
            Some(owner) => tracing::warn!(
                pool = %self.name,
                handle = %id,
                %owner,
                ?held,
                "Connection leak suspected"
            ),
            None => tracing::warn!(pool = %self.name, handle = %id, ?held, "Connection leak suspected"),
        }
        self.notify("on_leak", |l| l.on_leak(&self.name, id, owner.as_ref(), held));
        self.emit(|| PoolEvent::LeakSuspected {
            pool: self.name.clone(),
            handle: id,
            held,
        });
        true
    }

    /// Idle handles past the reap threshold, oldest first, at most as many
    /// as the pool holds above `min_size`.
    fn reap_candidates(&self, snapshot: &[HandleRef<F>]) -> Vec<HandleRef<F>> {
        let threshold = self.config.reap_idle_timeout;
        let mut idle: Vec<HandleRef<F>> = snapshot
            .iter()
            .filter(|h| h.state() == State::CheckedIn && h.idle_for() > threshold)
            .cloned()
            .collect();
        idle.sort_by_key(|h| h.last_access());
        let surplus = self
            .size
            .load(Ordering::SeqCst)
            .saturating_sub(self.min_size());
        idle.truncate(surplus);
        idle
    }

    /// Claim and close one idle handle, never taking the pool to `min_size`
    /// or below. Returns `false` if the handle was taken or the pool is at
    /// its floor.
    fn reap(&self, handle: &HandleRef<F>) -> bool {
        if self.is_closed() || handle.idle_for() <= self.config.reap_idle_timeout {
            return false;
        }
        let min_size = self.min_size();
        let reserved = self
            .size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size > min_size).then(|| size - 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }
        if !self.transition(handle, State::CheckedIn, State::ToDestroy) {
            self.size.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        let id = handle.id();
        let idle = handle.idle_for();
        Counters::bump(&self.counters.reaped);
        self.notify("on_timeout", |l| l.on_timeout(&self.name, id, idle));
        self.destroy_now(handle, DestroyReason::IdleTimeout, true);
        true
    }
}
