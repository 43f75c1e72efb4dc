//! The runtime: a single-threaded cooperative executor with a timer driver.
//!
//! Scheduling is cooperative: fibers share one executor and yield only at
//! suspension points (channel operations, sleeps, deferred and fiber
//! awaits). There is no pre-emption between suspension points, and none of
//! the runtime types are `Send`: a [`Runtime`] and everything it runs stay
//! on the thread that created it.
//!
//! [`Runtime::run`] drives a root future the way a fiber-based `block_on`
//! does: poll everything that is ready, and when the whole fleet of fibers
//! is suspended, advance the clock to the next timer deadline. With the
//! live clock that means parking the thread; with the virtual clock
//! ([`Runtime::with_test_clock`]) time jumps forward instantly, which makes
//! timing-sensitive tests deterministic.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::{pin_mut, FutureExt};

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::effect::{trap, Effect, Env};
use crate::exit::Exit;
use crate::fiber::{fork_unscoped, Fiber, FiberId, FiberState};
use crate::scope::Scope;
use crate::service::clock::{ClockService, RuntimeClock, TestClock};
use crate::service::logger::{FacadeLogger, LoggerService};
use crate::service::metrics::{InMemoryMetrics, MetricsService};
use crate::service::random::{LiveRandom, RandomService};
use crate::service::tracer::{NoopTracer, TracerService};

////////////////////////////////////////////////////////////////////////////////
// Wakers
////////////////////////////////////////////////////////////////////////////////

// The executor is single-threaded and its wakers never leave the thread, so
// building them over `Rc` is sound even though `Waker` is nominally
// `Send + Sync`.
pub(crate) trait LocalWake {
    fn wake(&self);
}

fn vtable<W: LocalWake + 'static>() -> &'static RawWakerVTable {
    &RawWakerVTable::new(
        clone_raw::<W>,
        wake_raw::<W>,
        wake_by_ref_raw::<W>,
        drop_raw::<W>,
    )
}

pub(crate) fn local_waker<W: LocalWake + 'static>(w: Rc<W>) -> Waker {
    unsafe { Waker::from_raw(raw_waker(w)) }
}

fn raw_waker<W: LocalWake + 'static>(w: Rc<W>) -> RawWaker {
    let ptr: *const () = Rc::into_raw(w).cast();
    RawWaker::new(ptr, vtable::<W>())
}

unsafe fn clone_raw<W: LocalWake + 'static>(data: *const ()) -> RawWaker {
    let rcw: Rc<W> = {
        Rc::increment_strong_count(data.cast::<W>());
        Rc::from_raw(data.cast::<W>())
    };
    raw_waker(rcw)
}

/// Represents `fn wake(self)`, must consume the data.
unsafe fn wake_raw<W: LocalWake + 'static>(data: *const ()) {
    let rcw: Rc<W> = Rc::from_raw(data.cast::<W>());
    rcw.wake();
    drop(rcw);
}

/// Represents `fn wake_by_ref(&self)`, must NOT consume the data.
unsafe fn wake_by_ref_raw<W: LocalWake + 'static>(data: *const ()) {
    let rcw: Rc<W> = Rc::from_raw(data.cast::<W>());
    rcw.wake();
    std::mem::forget(rcw);
}

unsafe fn drop_raw<W: LocalWake + 'static>(data: *const ()) {
    drop(Rc::<W>::from_raw(data.cast::<W>()));
}

struct RootWake {
    woken: Cell<bool>,
}

impl LocalWake for RootWake {
    fn wake(&self) {
        self.woken.set(true);
    }
}

struct TaskWake {
    ready: Rc<RefCell<VecDeque<u64>>>,
    tid: u64,
}

impl LocalWake for TaskWake {
    fn wake(&self) {
        self.ready.borrow_mut().push_back(self.tid);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Timer driver
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClockMode {
    Live,
    Virtual,
}

pub(crate) struct TimerState {
    done: Cell<bool>,
    cancelled: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

struct TimerEntry {
    deadline: Duration,
    seq: u64,
    state: Rc<TimerState>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Replaces an event loop's deadline bookkeeping: pending sleeps live in a
/// min-heap, and the executor advances to the earliest deadline whenever
/// every fiber is suspended.
pub(crate) struct TimerDriver {
    mode: ClockMode,
    origin: std::time::Instant,
    virtual_now: Cell<Duration>,
    seq: Cell<u64>,
    queue: RefCell<BinaryHeap<Reverse<TimerEntry>>>,
}

impl TimerDriver {
    fn new(mode: ClockMode) -> Rc<Self> {
        Rc::new(Self {
            mode,
            origin: std::time::Instant::now(),
            virtual_now: Cell::new(Duration::ZERO),
            seq: Cell::new(0),
            queue: RefCell::new(BinaryHeap::new()),
        })
    }

    /// Monotonic time since the runtime was created.
    pub(crate) fn now(&self) -> Duration {
        match self.mode {
            ClockMode::Live => self.origin.elapsed(),
            ClockMode::Virtual => self.virtual_now.get(),
        }
    }

    pub(crate) fn sleep(self: &Rc<Self>, d: Duration) -> Sleep {
        Sleep {
            driver: self.clone(),
            deadline: self.now().saturating_add(d),
            state: None,
        }
    }

    fn register(&self, deadline: Duration, state: Rc<TimerState>) {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.queue.borrow_mut().push(Reverse(TimerEntry {
            deadline,
            seq,
            state,
        }));
    }

    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        let mut queue = self.queue.borrow_mut();
        while let Some(Reverse(top)) = queue.peek() {
            if top.state.cancelled.get() || top.state.done.get() {
                queue.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    /// Moves time to `deadline` (parking the thread in live mode) and fires
    /// every timer that became due.
    pub(crate) fn advance_to(&self, deadline: Duration) {
        match self.mode {
            ClockMode::Live => {
                let now = self.now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
            }
            ClockMode::Virtual => {
                if deadline > self.virtual_now.get() {
                    self.virtual_now.set(deadline);
                }
            }
        }
        self.fire_due();
    }

    /// Advances virtual time by `d`. Meaningless with the live clock, where
    /// it only fires already-due timers.
    pub(crate) fn advance_by(&self, d: Duration) {
        if self.mode == ClockMode::Virtual {
            self.virtual_now.set(self.virtual_now.get().saturating_add(d));
        }
        self.fire_due();
    }

    fn fire_due(&self) {
        let now = self.now();
        loop {
            let entry = {
                let mut queue = self.queue.borrow_mut();
                match queue.peek() {
                    Some(Reverse(top))
                        if top.deadline <= now
                            || top.state.cancelled.get()
                            || top.state.done.get() =>
                    {
                        queue.pop()
                    }
                    _ => None,
                }
            };
            let Some(Reverse(entry)) = entry else { break };
            if entry.state.cancelled.get() || entry.state.done.get() {
                continue;
            }
            entry.state.done.set(true);
            if let Some(waker) = entry.state.waker.borrow_mut().take() {
                waker.wake();
            };
        }
    }
}

/// Future returned by [`TimerDriver::sleep`]. Registers itself lazily on
/// first poll; dropping it cancels the timer entry.
pub(crate) struct Sleep {
    driver: Rc<TimerDriver>,
    deadline: Duration,
    state: Option<Rc<TimerState>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some(state) = &this.state {
            if state.done.get() {
                return Poll::Ready(());
            }
            *state.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }
        if this.driver.now() >= this.deadline {
            return Poll::Ready(());
        }
        let state = Rc::new(TimerState {
            done: Cell::new(false),
            cancelled: Cell::new(false),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        this.driver.register(this.deadline, state.clone());
        this.state = Some(state);
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(state) = &self.state {
            if !state.done.get() {
                state.cancelled.set(true);
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Executor
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct Executor {
    ready: Rc<RefCell<VecDeque<u64>>>,
    tasks: RefCell<HashMap<u64, LocalBoxFuture<'static, ()>>>,
    next_task: Cell<u64>,
    next_fiber: Cell<u64>,
    timers: Rc<TimerDriver>,
    supervisor: RefCell<Option<Rc<dyn Supervisor>>>,
}

impl Executor {
    fn new(mode: ClockMode) -> Rc<Self> {
        Rc::new(Self {
            ready: Rc::new(RefCell::new(VecDeque::new())),
            tasks: RefCell::new(HashMap::new()),
            next_task: Cell::new(0),
            next_fiber: Cell::new(0),
            timers: TimerDriver::new(mode),
            supervisor: RefCell::new(None),
        })
    }

    pub(crate) fn timer_driver(&self) -> Rc<TimerDriver> {
        self.timers.clone()
    }

    pub(crate) fn next_fiber_id(&self) -> FiberId {
        let id = self.next_fiber.get();
        self.next_fiber.set(id + 1);
        FiberId(id)
    }

    pub(crate) fn supervisor(&self) -> Option<Rc<dyn Supervisor>> {
        self.supervisor.borrow().clone()
    }

    fn set_supervisor(&self, supervisor: Rc<dyn Supervisor>) {
        *self.supervisor.borrow_mut() = Some(supervisor);
    }

    pub(crate) fn notify_start(&self, fiber: FiberId) {
        if let Some(supervisor) = self.supervisor() {
            if let Err(defect) = trap(|| supervisor.on_start(fiber)) {
                log::error!("supervisor on_start hook died for fiber {fiber}: {defect}");
            }
        }
    }

    pub(crate) fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        let tid = self.next_task.get();
        self.next_task.set(tid + 1);
        self.tasks.borrow_mut().insert(tid, task);
        self.ready.borrow_mut().push_back(tid);
    }

    /// Drives `root` to completion, interleaving every spawned fiber and
    /// advancing the clock whenever the whole fleet is suspended. When every
    /// fiber is suspended and no timer is pending, nothing can ever wake
    /// the fleet again (the executor is single-threaded and has no external
    /// wake sources); the stall is reported as a defect to the caller
    /// instead of blocking forever.
    pub(crate) fn block_on<T>(&self, root: impl Future<Output = T>) -> Result<T, Defect> {
        let root_wake = Rc::new(RootWake {
            woken: Cell::new(true),
        });
        let root_waker = local_waker(root_wake.clone());
        pin_mut!(root);
        loop {
            if root_wake.woken.replace(false) {
                let mut cx = TaskContext::from_waker(&root_waker);
                if let Poll::Ready(value) = root.as_mut().poll(&mut cx) {
                    return Ok(value);
                }
            }
            loop {
                let tid = self.ready.borrow_mut().pop_front();
                let Some(tid) = tid else { break };
                let Some(mut task) = self.tasks.borrow_mut().remove(&tid) else {
                    continue;
                };
                let waker = local_waker(Rc::new(TaskWake {
                    ready: self.ready.clone(),
                    tid,
                }));
                let mut cx = TaskContext::from_waker(&waker);
                if task.as_mut().poll(&mut cx).is_pending() {
                    self.tasks.borrow_mut().insert(tid, task);
                }
            }
            if root_wake.woken.get() {
                continue;
            }
            match self.timers.next_deadline() {
                Some(deadline) => self.timers.advance_to(deadline),
                None => {
                    return Err(Defect::new(
                        "deadlock: every fiber is suspended and no timers are pending",
                    ));
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Supervisor
////////////////////////////////////////////////////////////////////////////////

/// How a supervised fiber ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberOutcome {
    Succeeded,
    Failed,
    Died,
    Interrupted,
}

/// Per-fiber lifecycle hooks. Hooks run serially on the runtime thread; a
/// panicking hook is trapped and reported through the `log` facade without
/// affecting the supervised fiber's outcome.
pub trait Supervisor {
    fn on_start(&self, _fiber: FiberId) {}
    fn on_end(&self, _fiber: FiberId, _outcome: &FiberOutcome) {}
    fn on_failure(&self, _fiber: FiberId, _rendered_cause: &str) {}
}

////////////////////////////////////////////////////////////////////////////////
// Runtime
////////////////////////////////////////////////////////////////////////////////

/// Owns the executor and a base service container with the default services
/// registered: a clock, a random source, a logger bridging onto the `log`
/// facade, an in-memory metrics registry and a no-op tracer.
pub struct Runtime {
    exec: Rc<Executor>,
    base: Context,
}

impl Runtime {
    /// A runtime on the live monotonic clock.
    pub fn new() -> Self {
        Self::with_mode(ClockMode::Live)
    }

    /// A runtime on a virtual clock starting at zero. Sleeps complete by
    /// jumping time forward, either automatically when every fiber is
    /// suspended or manually through [`TestClock::advance`].
    pub fn with_test_clock() -> Self {
        Self::with_mode(ClockMode::Virtual)
    }

    fn with_mode(mode: ClockMode) -> Self {
        let exec = Executor::new(mode);
        let driver = exec.timer_driver();
        let mut base = Context::new()
            .add(RandomService(Rc::new(LiveRandom::new())))
            .add(LoggerService(Rc::new(FacadeLogger)))
            .add(MetricsService(Rc::new(InMemoryMetrics::new())))
            .add(TracerService(Rc::new(NoopTracer)));
        base = match mode {
            ClockMode::Live => base.add(ClockService(Rc::new(RuntimeClock::new(driver)))),
            ClockMode::Virtual => {
                let test_clock = TestClock::new(driver);
                base.add(ClockService(Rc::new(test_clock.clone())))
                    .add(test_clock)
            }
        };
        Self { exec, base }
    }

    pub fn context(&self) -> &Context {
        &self.base
    }

    /// Registers an additional service in the base context.
    pub fn with_service<T: 'static>(mut self, service: T) -> Self {
        self.base = self.base.add(service);
        self
    }

    pub fn with_supervisor(self, supervisor: Rc<dyn Supervisor>) -> Self {
        self.exec.set_supervisor(supervisor);
        self
    }

    /// The virtual clock handle, present on runtimes built with
    /// [`Runtime::with_test_clock`].
    pub fn test_clock(&self) -> Option<TestClock> {
        self.base.get::<TestClock>().map(|rc| (*rc).clone())
    }

    /// Evaluates the computation in the foreground and returns its exit.
    /// The computation runs in a fresh root scope, closed on completion;
    /// close failures attach to the exit sequentially. A program that
    /// stalls with every fiber suspended and no pending timer exits with a
    /// deadlock defect.
    pub fn run<A: 'static, E: 'static>(&self, eff: Effect<A, E>) -> Exit<A, E> {
        let scope = Scope::new();
        let fiber = FiberState::new(self.exec.next_fiber_id());
        let env = Env {
            ctx: self.base.clone(),
            scope: scope.clone(),
            fiber,
            exec: self.exec.clone(),
        };
        let program = async move {
            let exit = match AssertUnwindSafe(eff.eval(env.clone())).catch_unwind().await {
                Ok(exit) => exit,
                Err(payload) => Exit::Failure(Cause::die(Defect::from_panic(payload))),
            };
            let close_exit = scope.close().eval(env).await;
            exit.with_finalizer_exit(close_exit)
        };
        let exit = match self.exec.block_on(program) {
            Ok(exit) => exit,
            Err(defect) => Exit::Failure(Cause::Die(defect)),
        };
        if let Exit::Failure(cause) = &exit {
            for defect in cause.defects() {
                log::error!("uncaught defect: {defect}");
            }
        }
        exit
    }

    /// Forks the computation in the background and returns its fiber. The
    /// fiber makes progress whenever this runtime is driving (inside
    /// [`Runtime::run`]); join it from a foreground computation to get its
    /// result.
    pub fn fork<A, E>(&self, eff: Effect<A, E>) -> Fiber<A, E>
    where
        A: 'static,
        E: std::fmt::Debug + 'static,
    {
        let scope = Scope::new();
        let parent = FiberState::new(self.exec.next_fiber_id());
        let env = Env {
            ctx: self.base.clone(),
            scope: scope.clone(),
            fiber: parent,
            exec: self.exec.clone(),
        };
        let wrapped = Effect::new(move |env: Env| {
            let eff = eff.clone();
            let scope = env.scope.clone();
            async move {
                let exit = eff.eval(env.clone()).await;
                let close_exit = scope.close().eval(env).await;
                exit.with_finalizer_exit(close_exit)
            }
            .boxed_local()
        });
        fork_unscoped(&env, wrapped)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
