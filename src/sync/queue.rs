//! An unbounded FIFO queue. Offering never suspends; taking suspends until
//! an item is available.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::FutureExt;

use crate::cause::Cause;
use crate::effect::{Effect, Env};
use crate::exit::Exit;
use crate::fiber::interruptible;

struct QueueState<T> {
    items: RefCell<VecDeque<T>>,
    wakers: RefCell<VecDeque<Waker>>,
}

/// Unbounded multi-producer multi-consumer FIFO queue.
pub struct Queue<T> {
    state: Rc<QueueState<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            state: Rc::new(QueueState {
                items: RefCell::new(VecDeque::new()),
                wakers: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.items.borrow().is_empty()
    }
}

impl<T: Clone + 'static> Queue<T> {
    /// Appends an item. Never suspends.
    pub fn offer<E: 'static>(&self, item: T) -> Effect<(), E> {
        let queue = self.clone();
        Effect::new(move |_| {
            let queue = queue.clone();
            let item = item.clone();
            async move {
                queue.state.items.borrow_mut().push_back(item);
                for waker in queue.state.wakers.borrow_mut().drain(..) {
                    waker.wake();
                }
                Exit::Success(())
            }
            .boxed_local()
        })
    }

    /// Removes the oldest item, suspending until one is available.
    pub fn take<E: 'static>(&self) -> Effect<T, E> {
        let queue = self.clone();
        Effect::new(move |env: Env| {
            let queue = queue.clone();
            async move {
                let fut = TakeFuture {
                    state: queue.state.clone(),
                };
                match interruptible(&env.fiber, fut).await {
                    Ok(item) => Exit::Success(item),
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                }
            }
            .boxed_local()
        })
    }

    /// Removes the oldest item if there is one, without suspending.
    pub fn try_take<E: 'static>(&self) -> Effect<Option<T>, E> {
        let queue = self.clone();
        Effect::new(move |_| {
            let queue = queue.clone();
            async move { Exit::Success(queue.state.items.borrow_mut().pop_front()) }.boxed_local()
        })
    }
}

struct TakeFuture<T> {
    state: Rc<QueueState<T>>,
}

impl<T> Future for TakeFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        if let Some(item) = self.state.items.borrow_mut().pop_front() {
            return Poll::Ready(item);
        }
        let mut wakers = self.state.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push_back(cx.waker().clone());
        }
        Poll::Pending
    }
}
