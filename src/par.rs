//! Parallel combinators.
//!
//! All of them share the cancellation-on-failure discipline: the first child
//! to fail or die causes immediate interruption of the remaining children,
//! which are then awaited for their final status, so no child fiber and no
//! resource can leak. Interrupt-caused exits of cancelled siblings are
//! absorbed; independent failures that had already occurred combine with
//! [`Cause::Both`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use futures::future::{select, select_all, Either};
use futures::FutureExt;

use crate::cause::Cause;
use crate::effect::{Effect, Env};
use crate::exit::Exit;
use crate::fiber::{fork_unscoped, interruptible, Fiber, FiberId};

async fn interrupt_and_await<A: Clone + 'static, E: Clone + 'static>(
    fiber: &Fiber<A, E>,
    by: FiberId,
) -> Exit<A, E> {
    fiber.state.signal_interrupt(Some(by));
    fiber.result.future().await
}

/// Folds a cancelled sibling's exit into the offending cause: interrupt-only
/// exits are absorbed, independent failures combine concurrently.
fn absorb_sibling<A, E>(primary: Cause<E>, sibling: Exit<A, E>) -> Cause<E> {
    match sibling {
        Exit::Success(_) => primary,
        Exit::Failure(cause) if cause.is_interrupt_only() => primary,
        Exit::Failure(cause) => Cause::both(primary, cause),
    }
}

////////////////////////////////////////////////////////////////////////////////
// zip_par
////////////////////////////////////////////////////////////////////////////////

/// Runs both computations concurrently; yields the pair on joint success.
/// On the first failure the other branch is interrupted and awaited.
pub fn zip_par<A, B, E>(left: Effect<A, E>, right: Effect<B, E>) -> Effect<(A, B), E>
where
    A: Clone + 'static,
    B: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    Effect::new(move |env| {
        let left = left.clone();
        let right = right.clone();
        async move {
            let fa = fork_unscoped(&env, left);
            let fb = fork_unscoped(&env, right);
            let me = env.fiber.id();
            let first = interruptible(&env.fiber, select(fa.result.future(), fb.result.future()));
            match first.await {
                Err(by) => {
                    interrupt_and_await(&fa, me).await;
                    interrupt_and_await(&fb, me).await;
                    Exit::Failure(Cause::Interrupt(by))
                }
                Ok(Either::Left((exit_a, fb_wait))) => match exit_a {
                    Exit::Success(a) => match interruptible(&env.fiber, fb_wait).await {
                        Err(by) => {
                            interrupt_and_await(&fb, me).await;
                            Exit::Failure(Cause::Interrupt(by))
                        }
                        Ok(Exit::Success(b)) => Exit::Success((a, b)),
                        Ok(Exit::Failure(cause)) => Exit::Failure(cause),
                    },
                    Exit::Failure(cause) => {
                        let sibling = interrupt_and_await(&fb, me).await;
                        Exit::Failure(absorb_sibling(cause, sibling))
                    }
                },
                Ok(Either::Right((exit_b, fa_wait))) => match exit_b {
                    Exit::Success(b) => match interruptible(&env.fiber, fa_wait).await {
                        Err(by) => {
                            interrupt_and_await(&fa, me).await;
                            Exit::Failure(Cause::Interrupt(by))
                        }
                        Ok(Exit::Success(a)) => Exit::Success((a, b)),
                        Ok(Exit::Failure(cause)) => Exit::Failure(cause),
                    },
                    Exit::Failure(cause) => {
                        let sibling = interrupt_and_await(&fa, me).await;
                        Exit::Failure(absorb_sibling(cause, sibling))
                    }
                },
            }
        }
        .boxed_local()
    })
}

////////////////////////////////////////////////////////////////////////////////
// race
////////////////////////////////////////////////////////////////////////////////

/// Yields the first *success*. A branch that fails first is ignored until
/// the other completes; if both fail, the causes combine concurrently. The
/// losing branch of a won race is interrupted and awaited.
pub fn race<A, E>(left: Effect<A, E>, right: Effect<A, E>) -> Effect<A, E>
where
    A: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    Effect::new(move |env| {
        let left = left.clone();
        let right = right.clone();
        async move {
            let fa = fork_unscoped(&env, left);
            let fb = fork_unscoped(&env, right);
            let me = env.fiber.id();
            let first = interruptible(&env.fiber, select(fa.result.future(), fb.result.future()));
            let (first_exit, loser, loser_wait) = match first.await {
                Err(by) => {
                    interrupt_and_await(&fa, me).await;
                    interrupt_and_await(&fb, me).await;
                    return Exit::Failure(Cause::Interrupt(by));
                }
                Ok(Either::Left((exit, fb_wait))) => (exit, fb, fb_wait),
                Ok(Either::Right((exit, fa_wait))) => (exit, fa, fa_wait),
            };
            match first_exit {
                Exit::Success(a) => {
                    interrupt_and_await(&loser, me).await;
                    Exit::Success(a)
                }
                Exit::Failure(first_cause) => {
                    match interruptible(&env.fiber, loser_wait).await {
                        Err(by) => {
                            interrupt_and_await(&loser, me).await;
                            Exit::Failure(Cause::Interrupt(by))
                        }
                        Ok(Exit::Success(a)) => Exit::Success(a),
                        Ok(Exit::Failure(second_cause)) => {
                            Exit::Failure(Cause::both(first_cause, second_cause))
                        }
                    }
                }
            }
        }
        .boxed_local()
    })
}

////////////////////////////////////////////////////////////////////////////////
// race_first / race_all
////////////////////////////////////////////////////////////////////////////////

/// Yields the first *completion*, success or failure, and cancels the rest.
/// Cancelled siblings are awaited and their exits discarded. An empty input
/// is a defect.
pub fn race_first<A, E>(effects: Vec<Effect<A, E>>) -> Effect<A, E>
where
    A: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    Effect::new(move |env| {
        let effects = effects.clone();
        async move {
            if effects.is_empty() {
                return Exit::Failure(Cause::die("empty race"));
            }
            let me = env.fiber.id();
            let fibers: Vec<_> = effects
                .into_iter()
                .map(|eff| fork_unscoped(&env, eff))
                .collect();
            let waits: Vec<_> = fibers.iter().map(|f| f.result.future()).collect();
            match interruptible(&env.fiber, select_all(waits)).await {
                Err(by) => {
                    for fiber in &fibers {
                        interrupt_and_await(fiber, me).await;
                    }
                    Exit::Failure(Cause::Interrupt(by))
                }
                Ok((exit, winner, rest)) => {
                    drop(rest);
                    for (i, fiber) in fibers.iter().enumerate() {
                        if i != winner {
                            interrupt_and_await(fiber, me).await;
                        }
                    }
                    exit
                }
            }
        }
        .boxed_local()
    })
}

/// Synonym for [`race_first`].
pub fn race_all<A, E>(effects: Vec<Effect<A, E>>) -> Effect<A, E>
where
    A: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    race_first(effects)
}

////////////////////////////////////////////////////////////////////////////////
// Bounded parallel collection
////////////////////////////////////////////////////////////////////////////////

/// Runs the given computations with at most `parallelism` running at once,
/// gathering results in input order.
fn collect_par<A, E>(effects: Vec<Effect<A, E>>, parallelism: usize) -> Effect<Vec<A>, E>
where
    A: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    Effect::new(move |env| {
        let effects = effects.clone();
        async move {
            if parallelism == 0 {
                return Exit::Failure(Cause::die("parallelism must be positive"));
            }
            let total = effects.len();
            if total == 0 {
                return Exit::Success(Vec::new());
            }
            let me = env.fiber.id();
            let pending: Rc<RefCell<VecDeque<(usize, Effect<A, E>)>>> =
                Rc::new(RefCell::new(effects.into_iter().enumerate().collect()));
            let results: Rc<RefCell<Vec<Option<A>>>> =
                Rc::new(RefCell::new((0..total).map(|_| None).collect()));

            let workers = parallelism.min(total);
            let fibers: Vec<Fiber<(), E>> = (0..workers)
                .map(|_| {
                    let pending = pending.clone();
                    let results = results.clone();
                    let worker = Effect::new(move |env: Env| {
                        let pending = pending.clone();
                        let results = results.clone();
                        async move {
                            loop {
                                if env.fiber.interrupt_pending() {
                                    return Exit::Failure(Cause::Interrupt(
                                        env.fiber.interrupted_by(),
                                    ));
                                }
                                let next = pending.borrow_mut().pop_front();
                                let Some((index, eff)) = next else {
                                    return Exit::Success(());
                                };
                                match eff.eval(env.clone()).await {
                                    Exit::Success(a) => results.borrow_mut()[index] = Some(a),
                                    Exit::Failure(cause) => return Exit::Failure(cause),
                                }
                            }
                        }
                        .boxed_local()
                    });
                    fork_unscoped(&env, worker)
                })
                .collect();

            let mut waits: Vec<_> = fibers.iter().map(|f| f.result.future()).collect();
            while !waits.is_empty() {
                match interruptible(&env.fiber, select_all(waits)).await {
                    Err(by) => {
                        for fiber in &fibers {
                            interrupt_and_await(fiber, me).await;
                        }
                        return Exit::Failure(Cause::Interrupt(by));
                    }
                    Ok((exit, _index, rest)) => match exit {
                        Exit::Success(()) => waits = rest,
                        Exit::Failure(mut cause) => {
                            for fiber in &fibers {
                                fiber.state.signal_interrupt(Some(me));
                            }
                            for wait in rest {
                                cause = absorb_sibling(cause, wait.await);
                            }
                            return Exit::Failure(cause);
                        }
                    },
                }
            }

            let gathered: Vec<A> = results
                .borrow_mut()
                .drain(..)
                .map(|slot| slot.expect("worker completed without storing its result"))
                .collect();
            Exit::Success(gathered)
        }
        .boxed_local()
    })
}

/// Runs all computations with bounded concurrency, gathering results in
/// input order. An empty input is a defect; `parallelism >= len` behaves as
/// unbounded.
pub fn merge_all<A, E>(effects: Vec<Effect<A, E>>, parallelism: usize) -> Effect<Vec<A>, E>
where
    A: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    if effects.is_empty() {
        return Effect::die("empty merge_all");
    }
    collect_par(effects, parallelism)
}

/// Parallel map with bounded concurrency; result order equals input order.
/// An empty input yields an empty vector.
pub fn for_each_par<I, A, E>(
    items: Vec<I>,
    f: impl Fn(I) -> Effect<A, E>,
    parallelism: usize,
) -> Effect<Vec<A>, E>
where
    I: 'static,
    A: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    let effects = items.into_iter().map(f).collect();
    collect_par(effects, parallelism)
}

////////////////////////////////////////////////////////////////////////////////
// Methods
////////////////////////////////////////////////////////////////////////////////

impl<A: Clone + 'static, E: Clone + fmt::Debug + 'static> Effect<A, E> {
    /// See [`zip_par`].
    pub fn zip_par<B: Clone + 'static>(self, other: Effect<B, E>) -> Effect<(A, B), E> {
        zip_par(self, other)
    }

    /// See [`race`].
    pub fn race(self, other: Effect<A, E>) -> Effect<A, E> {
        race(self, other)
    }

    /// Races the computation against a sleep. If the sleep wins, the
    /// computation is interrupted (its finalizers complete before `timeout`
    /// returns) and the result is absent.
    pub fn timeout(self, d: Duration) -> Effect<Option<A>, E> {
        Effect::new(move |env| {
            let this = self.clone();
            async move {
                let fiber = fork_unscoped(&env, this);
                let me = env.fiber.id();
                let sleep_fut = Effect::<(), E>::sleep(d).eval(env.clone());
                match interruptible(&env.fiber, select(fiber.result.future(), sleep_fut)).await {
                    Err(by) => {
                        interrupt_and_await(&fiber, me).await;
                        Exit::Failure(Cause::Interrupt(by))
                    }
                    Ok(Either::Left((exit, _sleep))) => exit.map(Some),
                    Ok(Either::Right((sleep_exit, fiber_wait))) => {
                        drop(fiber_wait);
                        match sleep_exit {
                            Exit::Success(()) => {
                                interrupt_and_await(&fiber, me).await;
                                Exit::Success(None)
                            }
                            Exit::Failure(cause) => {
                                interrupt_and_await(&fiber, me).await;
                                Exit::Failure(cause)
                            }
                        }
                    }
                }
            }
            .boxed_local()
        })
    }
}
