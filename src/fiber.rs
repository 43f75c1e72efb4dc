//! Fibers: forkable units of cooperative execution.
//!
//! A fiber is born *Running* when an effect is forked, publishes its
//! [`Exit`] to a result cell when it completes, and can be interrupted at
//! any of its suspension points. Cancellation is advisory, exactly like
//! cooperative fiber cancellation in general: an interrupt request is a flag
//! plus a wake-up, and the fiber observes it the next time it suspends (or
//! immediately, if it is already suspended). Finalizers registered by the
//! fiber always run to completion before the fiber reports its exit.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context as TaskContext, Poll, Waker};

use futures::FutureExt;

use crate::cause::Cause;
use crate::effect::{trap, Effect, Env};
use crate::exit::Exit;
use crate::runtime::FiberOutcome;
use crate::sync::deferred::Deferred;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Monotonically increasing fiber identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(pub(crate) u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fiber lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Forked and not yet completed.
    Running,
    /// An interrupt was requested but the fiber has not yet ceased.
    Interrupting,
    /// Completed with a success, failure or defect.
    Done,
    /// Ceased because of interruption.
    Interrupted,
}

////////////////////////////////////////////////////////////////////////////////
// FiberState
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct FiberState {
    id: FiberId,
    status: Cell<FiberStatus>,
    interrupted: Cell<bool>,
    interrupted_by: Cell<Option<FiberId>>,
    /// Depth of nested uninterruptible regions. While non-zero, a pending
    /// interrupt is not observed.
    mask: Cell<u32>,
    wakers: RefCell<Vec<Waker>>,
    locals: RefCell<HashMap<u64, Rc<dyn Any>>>,
}

impl FiberState {
    pub(crate) fn new(id: FiberId) -> Rc<Self> {
        Rc::new(Self {
            id,
            status: Cell::new(FiberStatus::Running),
            interrupted: Cell::new(false),
            interrupted_by: Cell::new(None),
            mask: Cell::new(0),
            wakers: RefCell::new(Vec::new()),
            locals: RefCell::new(HashMap::new()),
        })
    }

    /// A child fiber starts with a snapshot of the parent's locals.
    /// Subsequent writes on either side do not affect the other.
    pub(crate) fn child_of(parent: &FiberState, id: FiberId) -> Rc<Self> {
        let state = Self::new(id);
        *state.locals.borrow_mut() = parent.locals.borrow().clone();
        state
    }

    #[inline]
    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub(crate) fn status(&self) -> FiberStatus {
        self.status.get()
    }

    #[inline]
    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupted.get() && self.mask.get() == 0
    }

    #[inline]
    pub(crate) fn interrupted_by(&self) -> Option<FiberId> {
        self.interrupted_by.get()
    }

    #[inline]
    pub(crate) fn mask_depth(&self) -> u32 {
        self.mask.get()
    }

    /// Requests cancellation. Idempotent; the first request wins for the
    /// recorded interrupter.
    pub(crate) fn signal_interrupt(&self, by: Option<FiberId>) {
        if !self.interrupted.replace(true) {
            self.interrupted_by.set(by);
        }
        if self.status.get() == FiberStatus::Running {
            self.status.set(FiberStatus::Interrupting);
        }
        self.wake_all();
    }

    pub(crate) fn register_waker(&self, waker: &Waker) {
        let mut wakers = self.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn finish(&self, interrupted_only: bool) {
        self.status.set(if interrupted_only {
            FiberStatus::Interrupted
        } else {
            FiberStatus::Done
        });
    }

    pub(crate) fn local_get(&self, key: u64) -> Option<Rc<dyn Any>> {
        self.locals.borrow().get(&key).cloned()
    }

    pub(crate) fn local_set(&self, key: u64, value: Rc<dyn Any>) {
        self.locals.borrow_mut().insert(key, value);
    }

    pub(crate) fn locals_snapshot(&self) -> HashMap<u64, Rc<dyn Any>> {
        self.locals.borrow().clone()
    }

    pub(crate) fn locals_extend(&self, snapshot: HashMap<u64, Rc<dyn Any>>) {
        self.locals.borrow_mut().extend(snapshot);
    }
}

/// Holds the fiber in an uninterruptible region for as long as the guard is
/// alive. Dropping the guard (including mid-cancellation) restores the
/// previous depth.
pub(crate) struct MaskGuard {
    fiber: Rc<FiberState>,
}

impl MaskGuard {
    pub(crate) fn new(fiber: Rc<FiberState>) -> Self {
        fiber.mask.set(fiber.mask.get() + 1);
        Self { fiber }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        let depth = self.fiber.mask.get();
        debug_assert!(depth > 0, "unbalanced interrupt mask");
        self.fiber.mask.set(depth.saturating_sub(1));
    }
}

/// Temporarily sets the mask to an absolute depth, restoring the current one
/// on drop. Used by the `restore` capability of
/// [`Effect::uninterruptible_mask`].
pub(crate) struct SetMaskGuard {
    fiber: Rc<FiberState>,
    prev: u32,
}

impl SetMaskGuard {
    pub(crate) fn new(fiber: Rc<FiberState>, depth: u32) -> Self {
        let prev = fiber.mask.replace(depth);
        Self { fiber, prev }
    }
}

impl Drop for SetMaskGuard {
    fn drop(&mut self) {
        self.fiber.mask.set(self.prev);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Interruptible suspension
////////////////////////////////////////////////////////////////////////////////

/// Wraps a future so that the suspension also observes the fiber's interrupt
/// signal. Every designated suspension point of the runtime goes through
/// this wrapper.
pub(crate) struct Interruptible<F> {
    fiber: Rc<FiberState>,
    future: F,
}

pub(crate) fn interruptible<F: Future>(fiber: &Rc<FiberState>, future: F) -> Interruptible<F> {
    Interruptible {
        fiber: fiber.clone(),
        future,
    }
}

impl<F: Future> Future for Interruptible<F> {
    type Output = Result<F::Output, Option<FiberId>>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        // This is okay because `future` is pinned when `self` is.
        let this = unsafe { self.get_unchecked_mut() };
        if this.fiber.interrupt_pending() {
            return Poll::Ready(Err(this.fiber.interrupted_by()));
        }
        let future = unsafe { Pin::new_unchecked(&mut this.future) };
        match future.poll(cx) {
            Poll::Ready(v) => Poll::Ready(Ok(v)),
            Poll::Pending => {
                this.fiber.register_waker(cx.waker());
                Poll::Pending
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// Handle to a forked effect: identity, status, result and cancellation.
pub struct Fiber<A, E> {
    pub(crate) state: Rc<FiberState>,
    pub(crate) result: Deferred<Exit<A, E>>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            result: self.result.clone(),
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.state.id())
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}

impl<A: Clone + 'static, E: Clone + 'static> Fiber<A, E> {
    #[inline]
    pub fn id(&self) -> FiberId {
        self.state.id()
    }

    #[inline]
    pub fn status(&self) -> FiberStatus {
        self.state.status()
    }

    /// Suspends until the fiber completes and yields its exit.
    pub fn wait<E2: 'static>(&self) -> Effect<Exit<A, E>, E2> {
        let fiber = self.clone();
        Effect::from_async(move |env: Env| {
            let fiber = fiber.clone();
            async move {
                match interruptible(&env.fiber, fiber.result.future()).await {
                    Ok(exit) => Exit::Success(exit),
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                }
            }
        })
    }

    /// Suspends until the fiber completes; succeeds with its value or
    /// propagates its cause.
    pub fn join(&self) -> Effect<A, E> {
        let fiber = self.clone();
        Effect::from_async(move |env: Env| {
            let fiber = fiber.clone();
            async move {
                match interruptible(&env.fiber, fiber.result.future()).await {
                    Ok(exit) => exit,
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                }
            }
        })
    }

    /// Requests cancellation and awaits actual cessation. Idempotent. The
    /// await is not itself interruptible: an interrupter always learns the
    /// final exit of its victim.
    pub fn interrupt<E2: 'static>(&self) -> Effect<Exit<A, E>, E2> {
        let fiber = self.clone();
        Effect::from_async(move |env: Env| {
            let fiber = fiber.clone();
            async move {
                fiber.state.signal_interrupt(Some(env.fiber.id()));
                let exit = fiber.result.future().await;
                Exit::Success(exit)
            }
        })
    }

    /// Copies this fiber's local values into the current fiber.
    pub fn inherit_locals<E2: 'static>(&self) -> Effect<(), E2> {
        let fiber = self.clone();
        Effect::from_async(move |env: Env| {
            let fiber = fiber.clone();
            async move {
                env.fiber.locals_extend(fiber.state.locals_snapshot());
                Exit::Success(())
            }
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Forking
////////////////////////////////////////////////////////////////////////////////

/// Spawns `eff` on a new fiber without bounding its lifetime by any scope.
/// Callers own the handle and must await or interrupt it; the parallel
/// combinators rely on this to manage losers explicitly.
pub(crate) fn fork_unscoped<A, E>(env: &Env, eff: Effect<A, E>) -> Fiber<A, E>
where
    A: 'static,
    E: fmt::Debug + 'static,
{
    let id = env.exec.next_fiber_id();
    let state = FiberState::child_of(&env.fiber, id);
    let result = Deferred::new();
    let exec = env.exec.clone();

    exec.notify_start(id);
    log::trace!("fiber {id} forked by {}", env.fiber.id());

    let child_env = env.with_fiber(state.clone());
    let fiber = Fiber {
        state: state.clone(),
        result: result.clone(),
    };
    let task = async move {
        let exit = match std::panic::AssertUnwindSafe(eff.eval(child_env))
            .catch_unwind()
            .await
        {
            Ok(exit) => exit,
            Err(payload) => Exit::Failure(Cause::die(crate::cause::Defect::from_panic(payload))),
        };
        state.finish(exit.is_interrupted());
        log::trace!("fiber {id} finished: {:?}", state.status());
        notify_end(&exec, id, &exit);
        result.complete_now(exit);
    };
    env.exec.spawn(task.boxed_local());
    fiber
}

fn notify_end<A, E: fmt::Debug>(exec: &crate::runtime::Executor, id: FiberId, exit: &Exit<A, E>) {
    let Some(supervisor) = exec.supervisor() else {
        return;
    };
    let outcome = match exit {
        Exit::Success(_) => FiberOutcome::Succeeded,
        Exit::Failure(cause) if cause.is_interrupt_only() => FiberOutcome::Interrupted,
        Exit::Failure(cause) if cause.is_die() => FiberOutcome::Died,
        Exit::Failure(_) => FiberOutcome::Failed,
    };
    if let Err(defect) = trap(|| supervisor.on_end(id, &outcome)) {
        log::error!("supervisor on_end hook died for fiber {id}: {defect}");
    }
    if let Exit::Failure(cause) = exit {
        let rendered = cause.pretty_render();
        if let Err(defect) = trap(|| supervisor.on_failure(id, &rendered)) {
            log::error!("supervisor on_failure hook died for fiber {id}: {defect}");
        }
    }
}

impl<A: 'static, E: fmt::Debug + 'static> Effect<A, E> {
    /// Forks the effect onto a new fiber. The fiber's lifetime is bounded by
    /// the current scope: closing the scope interrupts the fiber and awaits
    /// its cessation.
    pub fn fork(self) -> Effect<Fiber<A, E>, E>
    where
        A: Clone,
        E: Clone,
    {
        Effect::new(move |env| {
            let eff = self.clone();
            async move {
                let fiber = fork_unscoped(&env, eff);
                let guard = fiber.clone();
                let register = env
                    .scope
                    .add_finalizer(guard.interrupt().map(|_| ()));
                match register.eval(env).await {
                    Exit::Success(()) => Exit::Success(fiber),
                    Exit::Failure(cause) => Exit::Failure(cause.widen()),
                }
            }
            .boxed_local()
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// FiberLocal
////////////////////////////////////////////////////////////////////////////////

static NEXT_LOCAL_KEY: AtomicU64 = AtomicU64::new(0);

/// Fiber-local storage with parent-to-child snapshot inheritance at fork.
#[derive(Clone)]
pub struct FiberLocal<T> {
    key: u64,
    initial: T,
}

impl<T: Clone + 'static> FiberLocal<T> {
    pub fn new(initial: T) -> Self {
        Self {
            key: NEXT_LOCAL_KEY.fetch_add(1, Ordering::Relaxed),
            initial,
        }
    }

    /// The current fiber's value, or the initial value if it was never set.
    pub fn get<E: 'static>(&self) -> Effect<T, E> {
        let local = self.clone();
        Effect::from_async(move |env: Env| {
            let local = local.clone();
            async move {
                let value = env
                    .fiber
                    .local_get(local.key)
                    .and_then(|any| any.downcast::<T>().ok())
                    .map(|rc| (*rc).clone())
                    .unwrap_or(local.initial);
                Exit::Success(value)
            }
        })
    }

    /// Sets the value for the current fiber only. Children forked afterwards
    /// inherit it; already-running fibers do not.
    pub fn set<E: 'static>(&self, value: T) -> Effect<(), E> {
        let key = self.key;
        Effect::from_async(move |env: Env| {
            let value = value.clone();
            async move {
                env.fiber.local_set(key, Rc::new(value));
                Exit::Success(())
            }
        })
    }
}
