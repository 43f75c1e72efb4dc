//! A single-assignment cell. Readers suspend until the value is set; on
//! set, waiters are woken in FIFO order. Completing a deferred twice is a
//! defect.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::FutureExt;

use once_cell::unsync::OnceCell;

use crate::cause::Cause;
use crate::effect::{Effect, Env};
use crate::exit::Exit;
use crate::fiber::interruptible;

struct DeferredState<T> {
    cell: OnceCell<T>,
    wakers: RefCell<VecDeque<Waker>>,
}

/// A cell that can be written exactly once and awaited by many readers.
pub struct Deferred<T> {
    state: Rc<DeferredState<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(DeferredState {
                cell: OnceCell::new(),
                wakers: RefCell::new(VecDeque::new()),
            }),
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.cell.get().is_some()
    }

    /// Sets the value if it was not set yet, waking waiters in FIFO order.
    /// Returns whether this call performed the write.
    pub(crate) fn complete_now(&self, value: T) -> bool {
        if self.state.cell.set(value).is_err() {
            return false;
        }
        for waker in self.state.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        true
    }
}

impl<T: Clone + 'static> Deferred<T> {
    /// A raw future resolving to a clone of the value, without observing
    /// interruption. The effect-level [`Deferred::wait`] wraps this.
    pub(crate) fn future(&self) -> DeferredWait<T> {
        DeferredWait {
            state: self.state.clone(),
        }
    }

    /// Suspends the current fiber until the value is available.
    pub fn wait<E: 'static>(&self) -> Effect<T, E> {
        let deferred = self.clone();
        Effect::new(move |env: Env| {
            let deferred = deferred.clone();
            async move {
                match interruptible(&env.fiber, deferred.future()).await {
                    Ok(value) => Exit::Success(value),
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                }
            }
            .boxed_local()
        })
    }

    /// Sets the value. Completing a deferred twice is a defect.
    pub fn complete<E: 'static>(&self, value: T) -> Effect<(), E> {
        let deferred = self.clone();
        Effect::new(move |_| {
            let deferred = deferred.clone();
            let value = value.clone();
            async move {
                if deferred.complete_now(value) {
                    Exit::Success(())
                } else {
                    Exit::Failure(Cause::die("deferred completed twice"))
                }
            }
            .boxed_local()
        })
    }

    /// Sets the value unless it was already set; yields whether this call
    /// won the write.
    pub fn try_complete<E: 'static>(&self, value: T) -> Effect<bool, E> {
        let deferred = self.clone();
        Effect::new(move |_| {
            let deferred = deferred.clone();
            let value = value.clone();
            async move { Exit::Success(deferred.complete_now(value)) }.boxed_local()
        })
    }
}

pub(crate) struct DeferredWait<T> {
    state: Rc<DeferredState<T>>,
}

impl<T: Clone> Future for DeferredWait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(value) = self.state.cell.get() {
            return Poll::Ready(value.clone());
        }
        let mut wakers = self.state.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push_back(cx.waker().clone());
        }
        Poll::Pending
    }
}
