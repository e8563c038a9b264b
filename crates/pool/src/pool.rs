//! Pool orchestrator.
//!
//! `Pool<F>` owns the authoritative handle collection and routes every
//! acquisition and return through the per-thread cache and the configured
//! handoff pool. Connections are created by `F`, off the caller's thread, on
//! the runtime that also drives housekeeping.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;

use crate::config::PoolConfig;
use crate::error::{BoxError, Error, Result};
use crate::events::{DestroyReason, EventBus, PoolEvent};
use crate::factory::ConnectionFactory;
use crate::guard::PooledConnection;
use crate::handle::{Handle, HandleId, HandleInfo, Owner};
use crate::handoff::{AnyHandoff, Handoff, HandoffStrategy, Take};
use crate::housekeeping::Scheduler;
use crate::listener::{Listeners, PoolListener};
use crate::local::{LocalKey, thread_token};
use crate::state::State;
use crate::stats::{Counters, Gauges, PoolStats};
use crate::transaction::UnitOfWork;

/// Upper bound on one blocking wait inside `acquire`, so a waiting caller
/// notices a failed creation or room to grow without waiting for a put.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Handles each thread remembers from its own recent returns.
const LOCAL_CACHE: usize = 16;

pub(crate) type HandleRef<F> = Arc<Handle<<F as ConnectionFactory>::Connection>>;

type LocalCache<F> = VecDeque<Weak<Handle<<F as ConnectionFactory>::Connection>>>;

// ---------------------------------------------------------------------------
// Creation ticket
// ---------------------------------------------------------------------------

/// Outcome slot of a creation scheduled on behalf of a waiting caller.
#[derive(Default)]
struct Ticket {
    outcome: Mutex<Option<std::result::Result<(), BoxError>>>,
}

impl Ticket {
    fn finish(&self, outcome: std::result::Result<(), BoxError>) {
        *self.outcome.lock() = Some(outcome);
    }

    fn poll(&self) -> Option<std::result::Result<(), BoxError>> {
        self.outcome.lock().take()
    }
}

/// A reserved size slot on its way to a creation task.
///
/// The runtime may drop a queued blocking task without running it when it
/// shuts down; the slot is then handed back on drop.
struct Reservation<F: ConnectionFactory> {
    pool: Weak<PoolInner<F>>,
    ticket: Option<Arc<Ticket>>,
    armed: bool,
}

impl<F: ConnectionFactory> Reservation<F> {
    fn run(mut self) {
        self.armed = false;
        if let Some(pool) = self.pool.upgrade() {
            pool.create_connection(self.ticket.as_deref());
        }
    }
}

impl<F: ConnectionFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.abandon_reservation();
            if let Some(ticket) = &self.ticket {
                ticket.finish(Err(Box::new(pool.closed_error())));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PoolInner
// ---------------------------------------------------------------------------

pub(crate) struct PoolInner<F: ConnectionFactory> {
    pub(crate) name: String,
    pub(crate) config: PoolConfig,
    min_size: AtomicUsize,
    /// Nanoseconds.
    acquisition_timeout: AtomicU64,
    pub(crate) factory: F,
    /// Authoritative collection, replaced wholesale on every insert/remove.
    handles: ArcSwap<Vec<HandleRef<F>>>,
    handoff: AnyHandoff<HandleRef<F>>,
    local: Option<LocalKey>,
    /// Live handles plus reserved creations.
    pub(crate) size: AtomicUsize,
    pending: AtomicUsize,
    next_id: AtomicU64,
    pub(crate) gauges: Gauges,
    pub(crate) counters: Counters,
    pub(crate) listeners: Listeners,
    pub(crate) events: EventBus,
    pub(crate) unit_of_work: Option<Arc<dyn UnitOfWork>>,
    closed: AtomicBool,
    settle_lock: Mutex<()>,
    settled: Condvar,
    scheduler: Mutex<Option<Scheduler>>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn min_size(&self) -> usize {
        self.min_size.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> Arc<Vec<HandleRef<F>>> {
        self.handles.load_full()
    }

    fn find(&self, id: HandleId) -> Option<HandleRef<F>> {
        self.handles.load().iter().find(|h| h.id() == id).cloned()
    }

    /// CAS a handle's state and keep the gauges in step.
    pub(crate) fn transition(&self, handle: &Handle<F::Connection>, from: State, to: State) -> bool {
        if handle.cas_state(from, to) {
            self.gauges.moved(from, to);
            true
        } else {
            false
        }
    }

    pub(crate) fn emit(&self, event: impl FnOnce() -> PoolEvent) {
        if self.events.has_subscribers() {
            self.events.emit(event());
        }
    }

    pub(crate) fn notify(&self, name: &'static str, hook: impl Fn(&dyn PoolListener)) {
        self.listeners.notify(&self.name, name, hook);
    }

    fn closed_error(&self) -> Error {
        Error::Closed {
            pool: self.name.clone(),
        }
    }

    // -- sizing -------------------------------------------------------------

    /// Reserve one slot below `limit` (and never above `max_size`).
    fn reserve(&self, limit: usize) -> bool {
        let limit = limit.min(self.config.max_size);
        let reserved = self
            .size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |size| {
                (size < limit).then_some(size + 1)
            })
            .is_ok();
        if reserved {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }
        reserved
    }

    /// Schedule creations until the pool holds `target` connections.
    pub(crate) fn fill_to(self: &Arc<Self>, target: usize) {
        while !self.is_closed() && self.reserve(target) {
            self.spawn_creation(None);
        }
    }

    pub(crate) fn top_up(self: &Arc<Self>) {
        self.fill_to(self.min_size());
    }

    /// Reserve a slot for a waiting caller and schedule its creation.
    fn try_grow(self: &Arc<Self>) -> Option<Arc<Ticket>> {
        if self.is_closed() || !self.reserve(self.config.max_size) {
            return None;
        }
        let ticket = Arc::new(Ticket::default());
        self.spawn_creation(Some(Arc::clone(&ticket)));
        Some(ticket)
    }

    fn spawn_creation(self: &Arc<Self>, ticket: Option<Arc<Ticket>>) {
        let reservation = Reservation {
            pool: Arc::downgrade(self),
            ticket,
            armed: true,
        };
        let runtime = self.scheduler.lock().as_ref().map(Scheduler::handle);
        if let Some(runtime) = runtime {
            runtime.spawn_blocking(move || reservation.run());
        }
    }

    fn abandon_reservation(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.signal_settled();
    }

    fn signal_settled(&self) {
        let _guard = self.settle_lock.lock();
        self.settled.notify_all();
    }

    /// Run the factory for a reserved slot and publish the result.
    fn create_connection(self: &Arc<Self>, ticket: Option<&Ticket>) {
        self.notify("before_create", |l| l.before_create(&self.name));
        let started = Instant::now();
        let created = catch_unwind(AssertUnwindSafe(|| self.factory.create()))
            .unwrap_or_else(|_| Err("connection factory panicked".into()));
        let elapsed = started.elapsed();

        match created {
            Ok(connection) => {
                let id = HandleId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
                let handle = Arc::new(Handle::new(id, connection));
                self.gauges.enter(State::New);
                self.handles.rcu(|current| {
                    let mut next = Vec::clone(current);
                    next.push(Arc::clone(&handle));
                    next
                });
                Counters::bump(&self.counters.created);
                tracing::debug!(pool = %self.name, handle = %id, ?elapsed, "Connection created");
                self.notify("after_create", |l| l.after_create(&self.name, Ok(id), elapsed));
                self.emit(|| PoolEvent::Created {
                    pool: self.name.clone(),
                    handle: id,
                    elapsed,
                });

                if self.is_closed() {
                    if self.transition(&handle, State::New, State::ToDestroy) {
                        self.destroy_now(&handle, DestroyReason::Shutdown, false);
                    }
                } else if self.transition(&handle, State::New, State::CheckedIn) {
                    handle.touch();
                    self.publish(&handle);
                }
                if let Some(ticket) = ticket {
                    ticket.finish(Ok(()));
                }
            }
            Err(error) => {
                self.size.fetch_sub(1, Ordering::SeqCst);
                Counters::bump(&self.counters.creation_failures);
                tracing::warn!(pool = %self.name, %error, "Failed to create connection");
                self.notify("after_create", |l| {
                    l.after_create(&self.name, Err(error.as_ref()), elapsed);
                });
                self.emit(|| PoolEvent::CreationFailed {
                    pool: self.name.clone(),
                    error: error.to_string(),
                });
                match ticket {
                    Some(ticket) => ticket.finish(Err(error)),
                    None => {
                        let message = format!("background connection creation failed: {error}");
                        self.notify("on_warning", |l| l.on_warning(&self.name, &message));
                    }
                }
            }
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.signal_settled();
    }

    pub(crate) fn wait_for_prefill(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut guard = self.settle_lock.lock();
        while self.pending.load(Ordering::SeqCst) > 0 {
            if self.settled.wait_until(&mut guard, deadline).timed_out() {
                return self.pending.load(Ordering::SeqCst) == 0;
            }
        }
        self.pending.load(Ordering::SeqCst) == 0
    }

    // -- availability -------------------------------------------------------

    /// Make a checked-in handle available, unless an entry for it is
    /// already queued.
    pub(crate) fn publish(&self, handle: &HandleRef<F>) {
        if !handle.mark_enqueued() {
            return;
        }
        if let Err(handle) = self.handoff.put(Arc::clone(handle)) {
            handle.clear_enqueued();
            if self.transition(&handle, State::CheckedIn, State::ToDestroy) {
                self.destroy_now(&handle, DestroyReason::Shutdown, false);
            }
        }
    }

    fn cache_locally(&self, handle: &HandleRef<F>) {
        let Some(local) = &self.local else {
            return;
        };
        let token = thread_token();
        if token == 0 {
            return;
        }
        handle.set_cache_owner(token);
        let weak = Arc::downgrade(handle);
        local.with(|cache: &mut LocalCache<F>| {
            if cache.len() >= LOCAL_CACHE {
                cache.pop_front();
            }
            cache.push_back(weak);
        });
    }

    /// Claim the most recently returned handle this thread still owns.
    fn take_local(&self) -> Option<HandleRef<F>> {
        let local = self.local.as_ref()?;
        let token = thread_token();
        local
            .with(|cache: &mut LocalCache<F>| {
                while let Some(weak) = cache.pop_back() {
                    let Some(handle) = weak.upgrade() else {
                        continue;
                    };
                    if handle.cache_owner() == token
                        && self.transition(&handle, State::CheckedIn, State::CheckedOut)
                    {
                        return Some(handle);
                    }
                }
                None
            })
            .flatten()
    }

    /// Claim a handle popped from the handoff pool; stale entries are dropped.
    fn claim(&self, handle: HandleRef<F>) -> Option<HandleRef<F>> {
        handle.clear_enqueued();
        self.transition(&handle, State::CheckedIn, State::CheckedOut)
            .then_some(handle)
    }

    fn take_shared(&self) -> Option<HandleRef<F>> {
        while let Some(handle) = self.handoff.try_take() {
            if let Some(handle) = self.claim(handle) {
                return Some(handle);
            }
        }
        None
    }

    // -- acquire ------------------------------------------------------------

    pub(crate) fn acquire(
        self: &Arc<Self>,
        deadline: Instant,
        location: &'static Location<'static>,
    ) -> Result<PooledConnection<F>> {
        let started = Instant::now();
        self.notify("before_acquire", |l| l.before_acquire(&self.name));
        let result = self.acquire_inner(started, deadline, location);
        let waited = started.elapsed();
        match &result {
            Ok(conn) => {
                let id = conn.id();
                self.notify("after_acquire", |l| l.after_acquire(&self.name, Ok(id), waited));
            }
            Err(error) => {
                self.notify("after_acquire", |l| l.after_acquire(&self.name, Err(error), waited));
            }
        }
        result
    }

    fn acquire_inner(
        self: &Arc<Self>,
        started: Instant,
        deadline: Instant,
        location: &'static Location<'static>,
    ) -> Result<PooledConnection<F>> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        if let Some(conn) = self.acquire_enlisted()? {
            return Ok(conn);
        }

        let mut ticket: Option<Arc<Ticket>> = None;
        loop {
            if let Some(handle) = self.take_local().or_else(|| self.take_shared()) {
                if let Some(conn) = self.check_out(handle, started, location) {
                    return Ok(conn);
                }
                continue;
            }

            if let Some(outcome) = ticket.as_ref().and_then(|t| t.poll()) {
                ticket = None;
                if let Err(source) = outcome {
                    if self.is_closed() {
                        return Err(self.closed_error());
                    }
                    return Err(Error::Creation {
                        pool: self.name.clone(),
                        source,
                    });
                }
            }
            if ticket.is_none() {
                ticket = self.try_grow();
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(started));
            }
            match self.handoff.take(Some(deadline.min(now + WAIT_SLICE))) {
                Take::Item(handle) => {
                    if let Some(conn) = self
                        .claim(handle)
                        .and_then(|handle| self.check_out(handle, started, location))
                    {
                        return Ok(conn);
                    }
                }
                Take::TimedOut => {}
                Take::Closed => return Err(self.closed_error()),
            }
        }
    }

    /// Reuse the handle enlisted in the caller's unit of work, if any.
    fn acquire_enlisted(self: &Arc<Self>) -> Result<Option<PooledConnection<F>>> {
        let Some(unit) = &self.unit_of_work else {
            return Ok(None);
        };
        let Some(id) = unit.get_current() else {
            return Ok(None);
        };
        let handle = match self.find(id) {
            Some(handle) if handle.state() == State::CheckedOut => handle,
            _ => {
                unit.disassociate(id);
                return Ok(None);
            }
        };
        let Some(connection) = handle.take_connection_in(State::CheckedOut) else {
            if handle.state() != State::CheckedOut {
                // returned between the lookup and the take
                unit.disassociate(id);
                return Ok(None);
            }
            return Err(Error::HandleBusy {
                pool: self.name.clone(),
                handle: id,
            });
        };
        handle.touch();
        tracing::debug!(pool = %self.name, handle = %id, "Reusing enlisted connection");
        Ok(Some(PooledConnection::new(
            Arc::clone(self),
            handle,
            connection,
            true,
        )))
    }

    /// Hand a claimed handle to the caller. `None` if the claim was lost or
    /// the connection is gone; a handle left without one is destroyed.
    fn check_out(
        self: &Arc<Self>,
        handle: HandleRef<F>,
        started: Instant,
        location: &'static Location<'static>,
    ) -> Option<PooledConnection<F>> {
        let id = handle.id();
        let Some(connection) = handle.take_connection_in(State::CheckedOut) else {
            if handle.state() == State::CheckedOut {
                tracing::warn!(pool = %self.name, handle = %id, "Claimed handle has no connection");
                self.retire(&handle, DestroyReason::Invalidated);
            }
            return None;
        };
        handle.touch();
        handle.set_owner(Owner::current(location));
        let waited = started.elapsed();
        Counters::bump(&self.counters.acquired);
        self.emit(|| PoolEvent::Acquired {
            pool: self.name.clone(),
            handle: id,
            waited,
        });

        let enlisted = self.unit_of_work.as_ref().is_some_and(|unit| {
            unit.associate(id);
            unit.get_current() == Some(id)
        });
        Some(PooledConnection::new(Arc::clone(self), handle, connection, enlisted))
    }

    fn timed_out(&self, started: Instant) -> Error {
        let waited = started.elapsed();
        Counters::bump(&self.counters.timeouts);
        self.emit(|| PoolEvent::AcquireTimedOut {
            pool: self.name.clone(),
            waited,
        });
        let error = Error::AcquireTimeout {
            pool: self.name.clone(),
            waited_ms: waited.as_millis() as u64,
            active: self.gauges.count(State::CheckedOut),
            max_size: self.config.max_size,
            waiters: self.handoff.waiters(),
        };
        tracing::debug!(pool = %self.name, %error, "Acquire timed out");
        error
    }

    // -- return -------------------------------------------------------------

    /// Return a checked-out handle. A no-op for any other state.
    pub(crate) fn release(self: &Arc<Self>, handle: &HandleRef<F>, acquired_at: Instant) {
        if handle.state() != State::CheckedOut {
            return;
        }
        handle.clear_owner();
        handle.touch();
        let to = self.return_state();
        if self.transition(handle, State::CheckedOut, to) {
            self.finish_return(handle, to, acquired_at);
        }
    }

    /// Where a returned handle goes: back in, or out when the pool is closed.
    fn return_state(&self) -> State {
        if self.is_closed() {
            State::ToDestroy
        } else {
            State::CheckedIn
        }
    }

    fn finish_return(self: &Arc<Self>, handle: &HandleRef<F>, to: State, acquired_at: Instant) {
        if to == State::ToDestroy {
            self.destroy_now(handle, DestroyReason::Shutdown, false);
            return;
        }
        let id = handle.id();
        let held = acquired_at.elapsed();
        Counters::bump(&self.counters.returned);
        self.notify("after_return", |l| l.after_return(&self.name, id, held));
        self.emit(|| PoolEvent::Returned {
            pool: self.name.clone(),
            handle: id,
            held,
        });
        self.cache_locally(handle);
        self.publish(handle);
    }

    /// Return a handle held by a completed unit of work.
    ///
    /// The slot check and the state change happen under the slot lock, so an
    /// enlisted borrow cannot start in between.
    fn release_enlisted(self: &Arc<Self>, id: HandleId) -> bool {
        let handle = match self.find(id) {
            Some(handle) if handle.state() == State::CheckedOut => handle,
            _ => {
                self.disassociate(id);
                return false;
            }
        };
        let acquired_at = handle.owner().map_or_else(Instant::now, |o| o.acquired_at);
        let to = {
            let slot = handle.slot();
            // a live guard holds the connection
            if slot.is_none() {
                return false;
            }
            self.disassociate(id);
            handle.clear_owner();
            handle.touch();
            let to = self.return_state();
            if !self.transition(&handle, State::CheckedOut, to) {
                return false;
            }
            to
        };
        self.finish_return(&handle, to, acquired_at);
        true
    }

    fn disassociate(&self, id: HandleId) {
        if let Some(unit) = &self.unit_of_work {
            unit.disassociate(id);
        }
    }

    /// Destroy a checked-out handle at its holder's request.
    pub(crate) fn retire(self: &Arc<Self>, handle: &HandleRef<F>, reason: DestroyReason) {
        self.disassociate(handle.id());
        handle.clear_owner();
        if self.transition(handle, State::CheckedOut, State::ToDestroy) {
            self.destroy(handle, reason, false);
        }
    }

    // -- destruction --------------------------------------------------------

    fn close_connection(&self, connection: F::Connection) -> std::result::Result<(), BoxError> {
        catch_unwind(AssertUnwindSafe(|| self.factory.close(connection)))
            .unwrap_or_else(|_| Err("connection factory panicked while closing".into()))
    }

    /// Finish destroying a handle this caller moved to `ToDestroy`.
    ///
    /// `reserved` means the size slot was already released by the caller.
    pub(crate) fn destroy_now(&self, handle: &Handle<F::Connection>, reason: DestroyReason, reserved: bool) {
        let id = handle.id();
        if let Some(connection) = handle.take_connection() {
            let result = self.close_connection(connection);
            if let Err(error) = &result {
                tracing::warn!(pool = %self.name, handle = %id, %error, "Failed to close connection");
            }
            self.notify("on_close", |l| {
                l.on_close(&self.name, id, result.as_ref().map(|_| ()).map_err(|e| &**e));
            });
        }
        self.transition(handle, State::ToDestroy, State::Destroyed);
        self.handles.rcu(|current| {
            current
                .iter()
                .filter(|h| h.id() != id)
                .cloned()
                .collect::<Vec<_>>()
        });
        if !reserved {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        Counters::bump(&self.counters.destroyed);
        tracing::debug!(pool = %self.name, handle = %id, %reason, "Connection destroyed");
        self.emit(|| PoolEvent::Destroyed {
            pool: self.name.clone(),
            handle: id,
            reason,
        });
    }

    /// [`destroy_now`](Self::destroy_now), then refill to `min_size`.
    pub(crate) fn destroy(self: &Arc<Self>, handle: &Handle<F::Connection>, reason: DestroyReason, reserved: bool) {
        self.destroy_now(handle, reason, reserved);
        if !self.is_closed() {
            self.top_up();
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pool = %self.name, "Closing pool");
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown();
        }
        for handle in self.handoff.close() {
            handle.clear_enqueued();
        }
        for handle in self.snapshot().iter() {
            if self.transition(handle, State::CheckedIn, State::ToDestroy) {
                self.destroy_now(handle, DestroyReason::Shutdown, false);
            }
        }
        self.signal_settled();
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

// ---------------------------------------------------------------------------
// PoolBuilder
// ---------------------------------------------------------------------------

/// Builder for a [`Pool`] with listeners or a unit-of-work hook.
///
/// Listeners registered here see the pre-fill creations; listeners added later
/// with [`Pool::add_listener`] may miss them.
pub struct PoolBuilder<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    listeners: Vec<Arc<dyn PoolListener>>,
    unit_of_work: Option<Arc<dyn UnitOfWork>>,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    /// Use `config` instead of the default configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a lifecycle listener.
    pub fn listener(mut self, listener: Arc<dyn PoolListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Consult `unit_of_work` before the normal acquire and return paths.
    pub fn unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = Some(unit_of_work);
        self
    }

    /// Validate the configuration, start housekeeping and schedule pre-fill.
    pub fn build(self) -> Result<Pool<F>> {
        let Self {
            factory,
            config,
            listeners,
            unit_of_work,
        } = self;
        config.validate()?;

        let inner = Arc::new(PoolInner {
            name: config.name.clone(),
            min_size: AtomicUsize::new(config.min_size),
            acquisition_timeout: AtomicU64::new(config.acquisition_timeout.as_nanos() as u64),
            factory,
            handles: ArcSwap::from_pointee(Vec::new()),
            handoff: AnyHandoff::new(config.strategy),
            local: config.thread_affinity.then(LocalKey::new),
            size: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            gauges: Gauges::default(),
            counters: Counters::default(),
            listeners: Listeners::default(),
            events: EventBus::new(config.event_buffer),
            unit_of_work,
            closed: AtomicBool::new(false),
            settle_lock: Mutex::new(()),
            settled: Condvar::new(),
            scheduler: Mutex::new(None),
            config,
        });
        for listener in listeners {
            inner.listeners.register(listener);
        }

        let scheduler = Scheduler::start(&inner)?;
        *inner.scheduler.lock() = Some(scheduler);

        let prefill = inner
            .config
            .prefill
            .target(inner.config.min_size, inner.config.max_size);
        inner.fill_to(prefill);

        tracing::info!(
            pool = %inner.name,
            strategy = %inner.config.strategy,
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            prefill,
            "Pool started"
        );
        Ok(Pool { inner })
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PoolBuilder<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pool<F>
// ---------------------------------------------------------------------------

/// Concurrent connection pool.
///
/// Cloning is cheap and every clone refers to the same pool. The pool closes
/// when [`close`](Self::close) is called or the last clone and the last
/// outstanding connection are dropped.
///
/// ```no_run
/// use std::time::Duration;
/// use reservoir_pool::{FnFactory, Pool, PoolConfig};
///
/// let factory = FnFactory::new(|| Ok::<_, reservoir_pool::BoxError>(Vec::<u8>::new()));
/// let pool = Pool::new(factory, PoolConfig::named("buffers").with_size(2, 8))?;
/// pool.wait_for_prefill(Duration::from_secs(1));
///
/// let mut conn = pool.acquire()?;
/// conn.push(1);
/// drop(conn); // back to the pool
/// # Ok::<(), reservoir_pool::Error>(())
/// ```
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("strategy", &self.inner.config.strategy)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool and schedule its pre-fill.
    ///
    /// Returns before the pre-fill creations finish; see
    /// [`wait_for_prefill`](Self::wait_for_prefill).
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        Self::builder(factory).config(config).build()
    }

    /// Start building a pool around `factory`.
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder {
            factory,
            config: PoolConfig::default(),
            listeners: Vec::new(),
            unit_of_work: None,
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Handoff algorithm in use.
    pub fn strategy(&self) -> HandoffStrategy {
        self.inner.config.strategy
    }

    /// The connection factory.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Acquire a connection, waiting up to the configured acquisition timeout.
    #[track_caller]
    pub fn acquire(&self) -> Result<PooledConnection<F>> {
        let timeout = self.acquisition_timeout();
        self.inner.acquire(deadline_after(timeout), Location::caller())
    }

    /// Acquire a connection, waiting up to `timeout`.
    #[track_caller]
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<F>> {
        self.inner.acquire(deadline_after(timeout), Location::caller())
    }

    /// Acquire a connection, waiting until `deadline` at the latest.
    #[track_caller]
    pub fn acquire_until(&self, deadline: Instant) -> Result<PooledConnection<F>> {
        self.inner.acquire(deadline, Location::caller())
    }

    /// Block until every scheduled creation has finished, successfully or
    /// not. Returns `false` if `timeout` passed first.
    pub fn wait_for_prefill(&self, timeout: Duration) -> bool {
        self.inner.wait_for_prefill(timeout)
    }

    /// Connections currently checked out.
    pub fn active_count(&self) -> usize {
        self.inner.gauges.count(State::CheckedOut)
    }

    /// Connections checked in and ready to be acquired.
    pub fn available_count(&self) -> usize {
        self.inner.gauges.count(State::CheckedIn)
    }

    /// Highest number of connections ever checked out at once.
    pub fn max_used_count(&self) -> usize {
        self.inner.gauges.max_used()
    }

    /// Live connections plus creations in flight.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    /// Callers currently blocked waiting for a connection.
    pub fn waiting_count(&self) -> usize {
        self.inner.handoff.waiters()
    }

    /// Current minimum size.
    pub fn min_size(&self) -> usize {
        self.inner.min_size()
    }

    /// Configured maximum size.
    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Change the minimum size and top the pool up to it.
    pub fn set_min_size(&self, min_size: usize) -> Result<()> {
        if min_size > self.inner.config.max_size {
            return Err(Error::configuration(format!(
                "min_size ({min_size}) must not exceed max_size ({})",
                self.inner.config.max_size
            )));
        }
        self.inner.min_size.store(min_size, Ordering::SeqCst);
        tracing::debug!(pool = %self.inner.name, min_size, "Minimum size changed");
        self.inner.top_up();
        Ok(())
    }

    /// Current default acquisition timeout.
    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_nanos(self.inner.acquisition_timeout.load(Ordering::SeqCst))
    }

    /// Change the default acquisition timeout.
    pub fn set_acquisition_timeout(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::configuration(
                "acquisition_timeout must be greater than zero",
            ));
        }
        self.inner
            .acquisition_timeout
            .store(timeout.as_nanos() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Snapshot of gauges and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let mut stats = PoolStats {
            size: inner.size.load(Ordering::SeqCst),
            idle: inner.gauges.count(State::CheckedIn),
            active: inner.gauges.count(State::CheckedOut),
            pending: inner.pending.load(Ordering::SeqCst),
            waiters: inner.handoff.waiters(),
            max_used: inner.gauges.max_used(),
            ..PoolStats::default()
        };
        inner.counters.fill(&mut stats);
        stats
    }

    /// Snapshot of every live handle.
    pub fn handles(&self) -> Vec<HandleInfo> {
        self.inner
            .snapshot()
            .iter()
            .map(|handle| HandleInfo::from(handle.as_ref()))
            .collect()
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Register a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn PoolListener>) {
        self.inner.listeners.register(listener);
    }

    /// Return the connection enlisted under `id` once its unit of work has
    /// completed. Returns `false` if the handle is unknown, not checked out,
    /// or still guarded.
    pub fn release_enlisted(&self, id: HandleId) -> bool {
        self.inner.release_enlisted(id)
    }

    /// Run a validation sweep on the calling thread. Returns the number of
    /// connections probed.
    pub fn run_validation(&self) -> usize {
        self.inner.run_sweep_inline(crate::housekeeping::Sweep::Validation)
    }

    /// Run a leak sweep on the calling thread. Returns the number of leak
    /// notifications issued.
    pub fn run_leak_detection(&self) -> usize {
        self.inner.run_sweep_inline(crate::housekeeping::Sweep::Leak)
    }

    /// Run a reap sweep on the calling thread. Returns the number of idle
    /// connections closed.
    pub fn run_reap(&self) -> usize {
        self.inner.run_sweep_inline(crate::housekeeping::Sweep::Reap)
    }

    /// Shut the pool down.
    ///
    /// Stops housekeeping, fails blocked acquirers with [`Error::Closed`],
    /// closes idle connections now and checked-out ones when their guard is
    /// dropped. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
