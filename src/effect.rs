//! The computation value: a lazy, environment-dependent async computation
//! with a typed failure channel.
//!
//! An [`Effect`] is a description. Building one has no side effects; only
//! evaluating it through a [`Runtime`](crate::Runtime) does. Descriptions
//! are re-runnable (`retry` and `repeat` evaluate the same value several
//! times), so every captured closure is `Fn` and every captured value is
//! `Clone`.
//!
//! The outcome of an evaluation is an [`Exit`]: a success value or a
//! [`Cause`] recording typed failures, defects and interruptions. Panics
//! raised by user thunks never escape the runtime; they become defects.
//!
//! ## Example
//! ```no_run
//! use strand::{Effect, Runtime};
//!
//! let program = Effect::<i32, String>::succeed(10)
//!     .map(|x| x * 2)
//!     .flat_map(|x| Effect::succeed(x + 3));
//! let exit = Runtime::new().run(program);
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::exit::Exit;
use crate::fiber::{interruptible, FiberState, MaskGuard, SetMaskGuard};
use crate::runtime::Executor;
use crate::scope::Scope;
use crate::service::clock::ClockService;

////////////////////////////////////////////////////////////////////////////////
// Env
////////////////////////////////////////////////////////////////////////////////

/// Everything the evaluator threads through a running computation: the
/// service container, the scope resources are released into, the fiber the
/// computation runs on, and the executor used for forking and timers.
#[derive(Clone)]
pub(crate) struct Env {
    pub(crate) ctx: Context,
    pub(crate) scope: Scope,
    pub(crate) fiber: Rc<FiberState>,
    pub(crate) exec: Rc<Executor>,
}

impl Env {
    pub(crate) fn with_ctx(&self, ctx: Context) -> Env {
        Env {
            ctx,
            ..self.clone()
        }
    }

    pub(crate) fn with_scope(&self, scope: Scope) -> Env {
        Env {
            scope,
            ..self.clone()
        }
    }

    pub(crate) fn with_fiber(&self, fiber: Rc<FiberState>) -> Env {
        Env {
            fiber,
            ..self.clone()
        }
    }
}

/// Runs a user callback, turning a panic into a [`Defect`].
pub(crate) fn trap<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(Defect::from_panic)
}

/// Runs a finalizer to completion inside an uninterruptible region,
/// trapping panics.
pub(crate) async fn run_finalizer(
    env: Env,
    finalizer: Effect<(), Infallible>,
) -> Exit<(), Infallible> {
    let _mask = MaskGuard::new(env.fiber.clone());
    match AssertUnwindSafe(finalizer.eval(env)).catch_unwind().await {
        Ok(exit) => exit,
        Err(payload) => Exit::Failure(Cause::die(Defect::from_panic(payload))),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Effect
////////////////////////////////////////////////////////////////////////////////

/// A lazily-evaluated async computation producing `A` or failing with a
/// typed `E` (or a defect, or an interruption; see [`Cause`]).
pub struct Effect<A, E> {
    run: Rc<dyn Fn(Env) -> LocalBoxFuture<'static, Exit<A, E>>>,
}

impl<A, E> Clone for Effect<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
        }
    }
}

impl<A, E> std::fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect").finish_non_exhaustive()
    }
}

impl<A: 'static, E: 'static> Effect<A, E> {
    pub(crate) fn new(
        run: impl Fn(Env) -> LocalBoxFuture<'static, Exit<A, E>> + 'static,
    ) -> Self {
        Self { run: Rc::new(run) }
    }

    pub(crate) fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Env) -> Fut + 'static,
        Fut: Future<Output = Exit<A, E>> + 'static,
    {
        Self::new(move |env| f(env).boxed_local())
    }

    pub(crate) fn eval(&self, env: Env) -> LocalBoxFuture<'static, Exit<A, E>> {
        (self.run)(env)
    }

    /// `true` if both values are the same description. Effects compare by
    /// identity, never structurally.
    #[allow(clippy::vtable_address_comparisons)]
    pub fn same(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.run, &other.run)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Constructors
////////////////////////////////////////////////////////////////////////////////

impl<A: 'static, E: 'static> Effect<A, E> {
    /// A computation that immediately succeeds with `a`.
    pub fn succeed(a: A) -> Self
    where
        A: Clone,
    {
        Self::from_async(move |_| {
            let a = a.clone();
            async move { Exit::Success(a) }
        })
    }

    /// A computation that fails on the typed channel.
    pub fn fail(e: E) -> Self
    where
        E: Clone,
    {
        Self::from_async(move |_| {
            let e = e.clone();
            async move { Exit::fail(e) }
        })
    }

    /// A computation that dies with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Self::from_async(move |_| {
            let defect = defect.clone();
            async move { Exit::Failure(Cause::Die(defect)) }
        })
    }

    /// A computation that ends with the given cause.
    pub fn from_cause(cause: Cause<E>) -> Self
    where
        E: Clone,
    {
        Self::from_async(move |_| {
            let cause = cause.clone();
            async move { Exit::Failure(cause) }
        })
    }

    /// Runs a pure thunk; a panic becomes a defect.
    pub fn sync(f: impl Fn() -> A + 'static) -> Self {
        Self::from_async(move |_| {
            let res = trap(&f);
            async move {
                match res {
                    Ok(a) => Exit::Success(a),
                    Err(defect) => Exit::Failure(Cause::Die(defect)),
                }
            }
        })
    }

    /// Runs a fallible thunk; a panic maps to a typed failure through
    /// `on_err`.
    pub fn attempt(f: impl Fn() -> A + 'static, on_err: impl Fn(Defect) -> E + 'static) -> Self {
        Self::from_async(move |_| {
            let res = match trap(&f) {
                Ok(a) => Exit::Success(a),
                Err(defect) => match trap(|| on_err(defect)) {
                    Ok(e) => Exit::fail(e),
                    Err(defect) => Exit::Failure(Cause::Die(defect)),
                },
            };
            async move { res }
        })
    }

    /// Runs a `Result`-returning thunk; a panic becomes a defect.
    pub fn attempt_result(f: impl Fn() -> Result<A, E> + 'static) -> Self {
        Self::from_async(move |_| {
            let res = match trap(&f) {
                Ok(res) => Exit::from(res),
                Err(defect) => Exit::Failure(Cause::Die(defect)),
            };
            async move { res }
        })
    }

    /// Lifts an already-computed `Result`.
    pub fn from_result(res: Result<A, E>) -> Self
    where
        A: Clone,
        E: Clone,
    {
        Self::from_async(move |_| {
            let res = res.clone();
            async move { Exit::from(res) }
        })
    }

    /// Defers construction of the computation until it runs.
    pub fn suspend(f: impl Fn() -> Effect<A, E> + 'static) -> Self {
        Self::new(move |env| match trap(&f) {
            Ok(eff) => eff.eval(env),
            Err(defect) => async move { Exit::Failure(Cause::Die(defect)) }.boxed_local(),
        })
    }

    /// Adopts an externally produced future. The suspension is a designated
    /// interruption point; on interrupt the future is dropped. A panic
    /// inside the future becomes a defect.
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<A, E>> + 'static,
    {
        Self::from_async(move |env| {
            let made = trap(&make);
            async move {
                let fut = match made {
                    Ok(fut) => fut,
                    Err(defect) => return Exit::Failure(Cause::Die(defect)),
                };
                match interruptible(&env.fiber, AssertUnwindSafe(fut).catch_unwind()).await {
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                    Ok(Ok(res)) => Exit::from(res),
                    Ok(Err(payload)) => Exit::Failure(Cause::die(Defect::from_panic(payload))),
                }
            }
        })
    }

    /// A computation that never completes. It still observes interruption.
    pub fn never() -> Self {
        Self::from_async(|env: Env| async move {
            match interruptible(&env.fiber, futures::future::pending::<Infallible>()).await {
                Ok(never) => match never {},
                Err(by) => Exit::Failure(Cause::Interrupt(by)),
            }
        })
    }

    /// Fetches a service from the context. A missing service is a defect.
    pub fn service() -> Self
    where
        A: Clone,
    {
        Self::from_async(|env: Env| async move {
            match env.ctx.get::<A>() {
                Some(service) => Exit::Success((*service).clone()),
                None => Exit::Failure(Cause::die(format!(
                    "missing service: {}",
                    std::any::type_name::<A>()
                ))),
            }
        })
    }
}

impl<E: 'static> Effect<(), E> {
    /// The trivial computation.
    pub fn unit() -> Self {
        Self::from_async(|_| async { Exit::Success(()) })
    }

    /// Suspends for `d` using the `Clock` service.
    pub fn sleep(d: Duration) -> Self {
        Effect::<ClockService, E>::service().flat_map(move |clock| clock.0.sleep(d).widen())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sequential combinators
////////////////////////////////////////////////////////////////////////////////

impl<A: 'static, E: 'static> Effect<A, E> {
    /// Transforms the success channel.
    pub fn map<B: 'static>(self, f: impl Fn(A) -> B + 'static) -> Effect<B, E> {
        let f = Rc::new(f);
        Effect::new(move |env| {
            let this = self.clone();
            let f = f.clone();
            async move {
                match this.eval(env).await {
                    Exit::Success(a) => match trap(|| f(a)) {
                        Ok(b) => Exit::Success(b),
                        Err(defect) => Exit::Failure(Cause::Die(defect)),
                    },
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            }
            .boxed_local()
        })
    }

    /// Transforms the typed failure channel. Defects and interruptions are
    /// untouched.
    pub fn map_error<E2: 'static>(self, f: impl Fn(E) -> E2 + 'static) -> Effect<A, E2> {
        let f = Rc::new(f);
        Effect::new(move |env| {
            let this = self.clone();
            let f = f.clone();
            async move {
                match this.eval(env).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => match trap(|| cause.map(&*f)) {
                        Ok(cause) => Exit::Failure(cause),
                        Err(defect) => Exit::Failure(Cause::Die(defect)),
                    },
                }
            }
            .boxed_local()
        })
    }

    /// Sequential composition: if `self` fails, `k` never runs.
    pub fn flat_map<B: 'static>(self, k: impl Fn(A) -> Effect<B, E> + 'static) -> Effect<B, E> {
        let k = Rc::new(k);
        Effect::new(move |env| {
            let this = self.clone();
            let k = k.clone();
            async move {
                match this.eval(env.clone()).await {
                    Exit::Success(a) => match trap(|| k(a)) {
                        Ok(next) => next.eval(env).await,
                        Err(defect) => Exit::Failure(Cause::Die(defect)),
                    },
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            }
            .boxed_local()
        })
    }

    /// Sequences `next` after `self`, keeping `next`'s value.
    pub fn then<B: 'static>(self, next: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| next.clone())
    }

    /// Sequential pairing.
    pub fn zip<B: 'static>(self, other: Effect<B, E>) -> Effect<(A, B), E>
    where
        A: Clone,
    {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Sequential pairing through `g`.
    pub fn zip_with<B: 'static, C: 'static>(
        self,
        other: Effect<B, E>,
        g: impl Fn(A, B) -> C + 'static,
    ) -> Effect<C, E>
    where
        A: Clone,
    {
        let g = Rc::new(g);
        self.flat_map(move |a| {
            let g = g.clone();
            other.clone().map(move |b| g(a.clone(), b))
        })
    }

    /// Sequences `other` after `self`, keeping `self`'s value.
    pub fn zip_left<B: 'static>(self, other: Effect<B, E>) -> Effect<A, E>
    where
        A: Clone,
    {
        self.zip_with(other, |a, _| a)
    }

    /// Sequences `other` after `self`, keeping `other`'s value.
    pub fn zip_right<B: 'static>(self, other: Effect<B, E>) -> Effect<B, E>
    where
        A: Clone,
    {
        self.zip_with(other, |_, b| b)
    }

    /// Replaces the success value.
    pub fn as_value<B: Clone + 'static>(self, b: B) -> Effect<B, E> {
        self.map(move |_| b.clone())
    }

    /// Runs `f` on the success value for its effects, yielding the original
    /// value.
    pub fn tap(self, f: impl Fn(&A) -> Effect<(), E> + 'static) -> Effect<A, E>
    where
        A: Clone,
    {
        let f = Rc::new(f);
        self.flat_map(move |a| {
            let f = f.clone();
            let observed = f(&a);
            observed.map(move |()| a.clone())
        })
    }

    /// Recovers from a typed failure. Defects and interruptions pass
    /// through.
    pub fn catch_all<E2: 'static>(
        self,
        h: impl Fn(E) -> Effect<A, E2> + 'static,
    ) -> Effect<A, E2>
    where
        E: Clone,
    {
        let h = Rc::new(h);
        Effect::new(move |env| {
            let this = self.clone();
            let h = h.clone();
            async move {
                match this.eval(env.clone()).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => match cause.first_failure().cloned() {
                        Some(e) => match trap(|| h(e)) {
                            Ok(recover) => recover.eval(env).await,
                            Err(defect) => Exit::Failure(Cause::Die(defect)),
                        },
                        None => Exit::Failure(cause.cast_failures_absent()),
                    },
                }
            }
            .boxed_local()
        })
    }

    /// Falls back to `that` on any typed failure.
    pub fn or_else<E2: 'static>(self, that: Effect<A, E2>) -> Effect<A, E2>
    where
        E: Clone,
    {
        self.catch_all(move |_| that.clone())
    }

    /// Total handling of both channels, including defects. An
    /// interrupt-only cause passes through untouched: typed recovery must
    /// not swallow cooperative cancellation.
    pub fn fold<B: 'static, E2: 'static>(
        self,
        on_failure: impl Fn(Cause<E>) -> B + 'static,
        on_success: impl Fn(A) -> B + 'static,
    ) -> Effect<B, E2> {
        let on_failure = Rc::new(on_failure);
        let on_success = Rc::new(on_success);
        Effect::new(move |env| {
            let this = self.clone();
            let on_failure = on_failure.clone();
            let on_success = on_success.clone();
            async move {
                let exit = this.eval(env).await;
                let handled = match exit {
                    Exit::Success(a) => trap(|| on_success(a)),
                    Exit::Failure(cause) if cause.is_interrupt_only() => {
                        return Exit::Failure(cause.cast_failures_absent());
                    }
                    Exit::Failure(cause) => trap(|| on_failure(cause)),
                };
                match handled {
                    Ok(b) => Exit::Success(b),
                    Err(defect) => Exit::Failure(Cause::Die(defect)),
                }
            }
            .boxed_local()
        })
    }

    /// Effectful total handling of both channels. Interrupt-only causes
    /// pass through as in [`Effect::fold`].
    pub fn fold_effect<B: 'static, E2: 'static>(
        self,
        on_failure: impl Fn(Cause<E>) -> Effect<B, E2> + 'static,
        on_success: impl Fn(A) -> Effect<B, E2> + 'static,
    ) -> Effect<B, E2> {
        let on_failure = Rc::new(on_failure);
        let on_success = Rc::new(on_success);
        Effect::new(move |env| {
            let this = self.clone();
            let on_failure = on_failure.clone();
            let on_success = on_success.clone();
            async move {
                let exit = this.eval(env.clone()).await;
                let next = match exit {
                    Exit::Success(a) => trap(|| on_success(a)),
                    Exit::Failure(cause) if cause.is_interrupt_only() => {
                        return Exit::Failure(cause.cast_failures_absent());
                    }
                    Exit::Failure(cause) => trap(|| on_failure(cause)),
                };
                match next {
                    Ok(eff) => eff.eval(env).await,
                    Err(defect) => Exit::Failure(Cause::Die(defect)),
                }
            }
            .boxed_local()
        })
    }

    /// Surfaces the typed failure as a value. Defects and interruptions
    /// still pass through the failure channel.
    pub fn either<E2: 'static>(self) -> Effect<Result<A, E>, E2>
    where
        E: Clone,
    {
        Effect::new(move |env| {
            let this = self.clone();
            async move {
                match this.eval(env).await {
                    Exit::Success(a) => Exit::Success(Ok(a)),
                    Exit::Failure(cause) => match cause.first_failure().cloned() {
                        Some(e) => Exit::Success(Err(e)),
                        None => Exit::Failure(cause.cast_failures_absent()),
                    },
                }
            }
            .boxed_local()
        })
    }

    /// Exposes the full cause on the typed channel, defects and
    /// interruptions included.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        Effect::new(move |env| {
            let this = self.clone();
            async move {
                match this.eval(env).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => Exit::fail(cause),
                }
            }
            .boxed_local()
        })
    }

    /// Narrows the typed failure to a subset; anything outside the subset
    /// becomes a defect.
    pub fn refine_or_die<E2: 'static>(
        self,
        p: impl Fn(E) -> Option<E2> + 'static,
    ) -> Effect<A, E2>
    where
        E: Clone + std::fmt::Debug,
    {
        let p = Rc::new(p);
        Effect::new(move |env| {
            let this = self.clone();
            let p = p.clone();
            async move {
                match this.eval(env).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => match cause.first_failure().cloned() {
                        Some(e) => match trap(|| p(e.clone())) {
                            Ok(Some(e2)) => Exit::fail(e2),
                            Ok(None) => {
                                Exit::Failure(Cause::die(format!("unrefined failure: {e:?}")))
                            }
                            Err(defect) => Exit::Failure(Cause::Die(defect)),
                        },
                        None => Exit::Failure(cause.cast_failures_absent()),
                    },
                }
            }
            .boxed_local()
        })
    }

    /// Always runs `finalizer` after `self`, whatever the outcome. The
    /// finalizer executes in an uninterruptible region; its defects combine
    /// with the primary cause sequentially.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            let finalizer = finalizer.clone();
            async move {
                let exit = this.eval(env.clone()).await;
                let fin_exit = run_finalizer(env, finalizer).await;
                exit.with_finalizer_exit(fin_exit)
            }
            .boxed_local()
        })
    }

    /// Runs `h` when `self` fails with a typed failure or a defect. A pure
    /// interruption is left to [`Effect::on_interrupt`].
    pub fn on_error(
        self,
        h: impl Fn(&Cause<E>) -> Effect<(), Infallible> + 'static,
    ) -> Effect<A, E> {
        let h = Rc::new(h);
        Effect::new(move |env| {
            let this = self.clone();
            let h = h.clone();
            async move {
                match this.eval(env.clone()).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => {
                        if cause.is_interrupt_only() {
                            return Exit::Failure(cause);
                        }
                        let fin_exit = match trap(|| h(&cause)) {
                            Ok(fin) => run_finalizer(env, fin).await,
                            Err(defect) => Exit::Failure(Cause::Die(defect)),
                        };
                        Exit::<A, E>::Failure(cause).with_finalizer_exit(fin_exit)
                    }
                }
            }
            .boxed_local()
        })
    }

    /// Runs `finalizer` only when the computation was interrupted.
    pub fn on_interrupt(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            let finalizer = finalizer.clone();
            async move {
                match this.eval(env.clone()).await {
                    Exit::Failure(cause) if cause.is_interrupt() => {
                        let fin_exit = run_finalizer(env, finalizer).await;
                        Exit::<A, E>::Failure(cause).with_finalizer_exit(fin_exit)
                    }
                    exit => exit,
                }
            }
            .boxed_local()
        })
    }

    /// Attaches a contextual note to any cause this computation produces.
    pub fn annotate(self, note: impl Into<String>) -> Effect<A, E> {
        let note: Rc<str> = Rc::from(note.into());
        Effect::new(move |env| {
            let this = self.clone();
            let note = note.clone();
            async move {
                this.eval(env)
                    .await
                    .map_cause(|cause| cause.annotated(note.to_string()))
            }
            .boxed_local()
        })
    }

    /// Acquires a resource and registers its release on the nearest scope.
    /// The acquisition is uninterruptible; on acquire failure no release is
    /// registered. The release runs even when the computation that uses the
    /// resource is interrupted.
    pub fn acquire_release(
        acquire: Effect<A, E>,
        release: impl Fn(A) -> Effect<(), Infallible> + 'static,
    ) -> Effect<A, E>
    where
        A: Clone,
    {
        let release = Rc::new(release);
        Effect::new(move |env| {
            let acquire = acquire.clone();
            let release = release.clone();
            async move {
                let _mask = MaskGuard::new(env.fiber.clone());
                match acquire.eval(env.clone()).await {
                    Exit::Success(a) => {
                        let resource = a.clone();
                        let fin = match trap(move || release(resource)) {
                            Ok(fin) => fin,
                            Err(defect) => return Exit::Failure(Cause::Die(defect)),
                        };
                        let registered = env.scope.add_finalizer(fin).eval(env.clone()).await;
                        Exit::Success(a).with_finalizer_exit(registered)
                    }
                    failure => failure,
                }
            }
            .boxed_local()
        })
    }

    /// Suppresses interruption for the whole computation. An interrupt
    /// requested meanwhile is observed on exit.
    pub fn uninterruptible(self) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            async move {
                let exit = {
                    let _mask = MaskGuard::new(env.fiber.clone());
                    this.eval(env.clone()).await
                };
                match exit {
                    Exit::Success(_) if env.fiber.interrupt_pending() => {
                        Exit::Failure(Cause::Interrupt(env.fiber.interrupted_by()))
                    }
                    exit => exit,
                }
            }
            .boxed_local()
        })
    }

    /// Runs `f` in an uninterruptible region, passing a [`Restore`]
    /// capability that reinstates the interruptibility that was current at
    /// mask entry for a chosen sub-effect. An interrupt requested during the
    /// masked region is observed at the first suspension point inside a
    /// restored sub-effect, or on region exit.
    pub fn uninterruptible_mask(f: impl Fn(Restore) -> Effect<A, E> + 'static) -> Effect<A, E> {
        let f = Rc::new(f);
        Effect::new(move |env| {
            let f = f.clone();
            async move {
                let saved = env.fiber.mask_depth();
                let exit = {
                    let _mask = MaskGuard::new(env.fiber.clone());
                    match trap(|| f(Restore { depth: saved })) {
                        Ok(region) => region.eval(env.clone()).await,
                        Err(defect) => Exit::Failure(Cause::Die(defect)),
                    }
                };
                match exit {
                    Exit::Success(_) if env.fiber.interrupt_pending() => {
                        Exit::Failure(Cause::Interrupt(env.fiber.interrupted_by()))
                    }
                    exit => exit,
                }
            }
            .boxed_local()
        })
    }

    /// Runs the computation with the given context instead of the ambient
    /// one.
    pub fn provide_context(self, ctx: Context) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            let ctx = ctx.clone();
            async move { this.eval(env.with_ctx(ctx)).await }.boxed_local()
        })
    }

    /// Delays the computation by `d` using the `Clock` service.
    pub fn delay(self, d: Duration) -> Effect<A, E> {
        Effect::<(), E>::sleep(d).then(self)
    }

    /// Repeats the computation forever; only a failure or an interruption
    /// ends it.
    pub fn forever(self) -> Effect<(), E> {
        Effect::new(move |env| {
            let this = self.clone();
            async move {
                loop {
                    if env.fiber.interrupt_pending() {
                        return Exit::Failure(Cause::Interrupt(env.fiber.interrupted_by()));
                    }
                    if let Exit::Failure(cause) = this.eval(env.clone()).await {
                        return Exit::Failure(cause);
                    }
                }
            }
            .boxed_local()
        })
    }
}

impl<A: 'static, E: Clone + 'static> Effect<A, E> {
    /// Runs `h` on the typed failure for its effects, re-surfacing the
    /// original failure afterwards.
    pub fn tap_error(self, h: impl Fn(&E) -> Effect<(), Infallible> + 'static) -> Effect<A, E> {
        let h = Rc::new(h);
        self.on_error(move |cause| match cause.first_failure() {
            Some(e) => h(e),
            None => Effect::unit(),
        })
    }
}

impl<A: 'static> Effect<A, Infallible> {
    /// An infallible computation embeds into any error channel.
    pub fn widen<E: 'static>(self) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            async move { this.eval(env).await.map_cause(Cause::widen) }.boxed_local()
        })
    }
}

/// Capability handed to [`Effect::uninterruptible_mask`] regions.
#[derive(Debug, Clone, Copy)]
pub struct Restore {
    depth: u32,
}

impl Restore {
    /// Reinstates the pre-mask interruptibility for `eff`.
    pub fn restore<A: 'static, E: 'static>(&self, eff: Effect<A, E>) -> Effect<A, E> {
        let depth = self.depth;
        Effect::new(move |env| {
            let eff = eff.clone();
            async move {
                let _restore = SetMaskGuard::new(env.fiber.clone(), depth);
                eff.eval(env.clone()).await
            }
            .boxed_local()
        })
    }
}
