//! A bounded multi-producer multi-consumer channel with close.
//!
//! Senders suspend while the buffer is full; a capacity of zero makes every
//! send a rendezvous with a receiver. Closing is idempotent: buffered items
//! stay receivable, further sends fail returning the item, and blocked
//! senders are woken to fail. Blocked *receivers* are deliberately not woken
//! by close; a protocol that wants eager receiver shutdown must arrange
//! termination sentinels or exact counts. Within a single sender–receiver
//! pair, items are received in send order.

use std::cell::{Cell, RefCell};
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

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

/// Error of a suspending send. The undelivered item is returned to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError<T> {
    #[error("channel closed")]
    Closed(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Closed(t) => t,
        }
    }
}

/// Error of a non-suspending send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrySendError<T> {
    #[error("channel full")]
    Full(T),
    #[error("channel closed")]
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(t) | Self::Closed(t) => t,
        }
    }
}

impl<T> From<SendError<T>> for TrySendError<T> {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Closed(t) => Self::Closed(t),
        }
    }
}

/// Error of a suspending receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("channel closed")]
    Closed,
}

/// Error of a non-suspending receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryRecvError {
    #[error("channel empty")]
    Empty,
    #[error("channel closed")]
    Closed,
}

impl From<RecvError> for TryRecvError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Closed => Self::Closed,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

/// A blocked sender parks its item in a slot; a receiver either consumes it
/// directly (rendezvous) or moves it into the buffer when capacity frees.
struct SendSlot<T> {
    item: RefCell<Option<T>>,
    taken: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl<T> SendSlot<T> {
    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }

    fn is_dead(&self) -> bool {
        self.taken.get() || self.item.borrow().is_none()
    }
}

struct ChannelState<T> {
    cap: usize,
    queue: RefCell<VecDeque<T>>,
    closed: Cell<bool>,
    send_waiters: RefCell<VecDeque<Rc<SendSlot<T>>>>,
    recv_wakers: RefCell<VecDeque<Waker>>,
}

impl<T> ChannelState<T> {
    fn wake_receivers(&self) {
        for waker in self.recv_wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    fn has_waiting_senders(&self) -> bool {
        self.send_waiters.borrow().iter().any(|slot| !slot.is_dead())
    }

    /// Takes the next available item: from the buffer first, refilling it
    /// from parked senders, or directly from a parked sender when the
    /// buffer cannot hold items (capacity zero).
    fn pop_item(&self) -> Option<T> {
        let from_queue = {
            let mut queue = self.queue.borrow_mut();
            let item = queue.pop_front();
            if item.is_some() {
                self.refill(&mut queue);
            }
            item
        };
        if from_queue.is_some() {
            return from_queue;
        }
        self.take_from_waiter()
    }

    fn refill(&self, queue: &mut VecDeque<T>) {
        let mut waiters = self.send_waiters.borrow_mut();
        while queue.len() < self.cap {
            while matches!(waiters.front(), Some(slot) if slot.is_dead()) {
                waiters.pop_front();
            }
            let Some(slot) = waiters.pop_front() else { break };
            let item = slot.item.borrow_mut().take();
            match item {
                Some(item) => {
                    slot.taken.set(true);
                    slot.wake();
                    queue.push_back(item);
                }
                None => continue,
            }
        }
    }

    fn take_from_waiter(&self) -> Option<T> {
        let mut waiters = self.send_waiters.borrow_mut();
        loop {
            while matches!(waiters.front(), Some(slot) if slot.is_dead()) {
                waiters.pop_front();
            }
            let slot = waiters.pop_front()?;
            let item = slot.item.borrow_mut().take();
            if let Some(item) = item {
                slot.taken.set(true);
                slot.wake();
                return Some(item);
            }
        }
    }
}

/// Bounded MPMC channel. Cloning shares the same channel.
pub struct Channel<T> {
    state: Rc<ChannelState<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.state.cap)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Channel<T> {
    /// A channel buffering at most `cap` items. `cap == 0` makes every send
    /// a rendezvous.
    pub fn bounded(cap: usize) -> Self {
        Self {
            state: Rc::new(ChannelState {
                cap,
                queue: RefCell::new(VecDeque::new()),
                closed: Cell::new(false),
                send_waiters: RefCell::new(VecDeque::new()),
                recv_wakers: RefCell::new(VecDeque::new()),
            }),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.state.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.state.queue.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.queue.borrow().is_empty()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Closes without suspending. Wakes parked senders (their sends fail,
    /// returning the item) but not parked receivers.
    pub(crate) fn close_now(&self) {
        if self.state.closed.replace(true) {
            return;
        }
        let waiters: Vec<_> = self.state.send_waiters.borrow_mut().drain(..).collect();
        for slot in waiters {
            slot.wake();
        }
    }
}

impl<T: Clone + 'static> Channel<T> {
    /// Sends an item, suspending until there is capacity or the channel
    /// closes.
    pub fn send(&self, item: T) -> Effect<(), SendError<T>> {
        let chan = self.clone();
        Effect::new(move |env: Env| {
            let chan = chan.clone();
            let item = item.clone();
            async move {
                let fut = SendFuture {
                    chan: chan.state.clone(),
                    item: Some(item),
                    slot: None,
                };
                match interruptible(&env.fiber, fut).await {
                    Ok(Ok(())) => Exit::Success(()),
                    Ok(Err(e)) => Exit::fail(e),
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                }
            }
            .boxed_local()
        })
    }

    /// Receives the next item, suspending until one is available. Fails
    /// once the channel is closed and drained.
    pub fn receive(&self) -> Effect<T, RecvError> {
        let chan = self.clone();
        Effect::new(move |env: Env| {
            let chan = chan.clone();
            async move {
                let fut = RecvFuture {
                    chan: chan.state.clone(),
                };
                match interruptible(&env.fiber, fut).await {
                    Ok(Ok(item)) => Exit::Success(item),
                    Ok(Err(e)) => Exit::fail(e),
                    Err(by) => Exit::Failure(Cause::Interrupt(by)),
                }
            }
            .boxed_local()
        })
    }

    /// Non-suspending send.
    pub fn try_send(&self, item: T) -> Effect<(), TrySendError<T>> {
        let chan = self.clone();
        Effect::new(move |_| {
            let chan = chan.clone();
            let item = item.clone();
            async move {
                if chan.state.closed.get() {
                    return Exit::fail(TrySendError::Closed(item));
                }
                let mut queue = chan.state.queue.borrow_mut();
                if queue.len() < chan.state.cap && !chan.state.has_waiting_senders() {
                    queue.push_back(item);
                    drop(queue);
                    chan.state.wake_receivers();
                    Exit::Success(())
                } else {
                    Exit::fail(TrySendError::Full(item))
                }
            }
            .boxed_local()
        })
    }

    /// Non-suspending receive.
    pub fn try_receive(&self) -> Effect<T, TryRecvError> {
        let chan = self.clone();
        Effect::new(move |_| {
            let chan = chan.clone();
            async move {
                if let Some(item) = chan.state.pop_item() {
                    Exit::Success(item)
                } else if chan.state.closed.get() {
                    Exit::fail(TryRecvError::Closed)
                } else {
                    Exit::fail(TryRecvError::Empty)
                }
            }
            .boxed_local()
        })
    }

    /// Closes the channel. Idempotent; buffered items remain receivable.
    pub fn close<E: 'static>(&self) -> Effect<(), E> {
        let chan = self.clone();
        Effect::new(move |_| {
            let chan = chan.clone();
            async move {
                chan.close_now();
                Exit::Success(())
            }
            .boxed_local()
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Futures
////////////////////////////////////////////////////////////////////////////////

struct SendFuture<T> {
    chan: Rc<ChannelState<T>>,
    item: Option<T>,
    slot: Option<Rc<SendSlot<T>>>,
}

impl<T> Future for SendFuture<T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: SendFuture holds no self-referential state; none of its
        // fields rely on the pinning guarantee.
        let this = unsafe { self.get_unchecked_mut() };
        if let Some(slot) = &this.slot {
            if slot.taken.get() {
                return Poll::Ready(Ok(()));
            }
            if this.chan.closed.get() {
                let item = slot.item.borrow_mut().take();
                slot.taken.set(true);
                return match item {
                    Some(item) => Poll::Ready(Err(SendError::Closed(item))),
                    // The item was consumed concurrently with the close.
                    None => Poll::Ready(Ok(())),
                };
            }
            *slot.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if this.chan.closed.get() {
            let item = this.item.take().expect("send polled after completion");
            return Poll::Ready(Err(SendError::Closed(item)));
        }
        {
            let mut queue = this.chan.queue.borrow_mut();
            if queue.len() < this.chan.cap && !this.chan.has_waiting_senders() {
                queue.push_back(this.item.take().expect("send polled after completion"));
                drop(queue);
                this.chan.wake_receivers();
                return Poll::Ready(Ok(()));
            }
        }
        let slot = Rc::new(SendSlot {
            item: RefCell::new(this.item.take()),
            taken: Cell::new(false),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        this.chan.send_waiters.borrow_mut().push_back(slot.clone());
        this.slot = Some(slot);
        // A receiver may already be parked waiting for a rendezvous.
        this.chan.wake_receivers();
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<T> {
    fn drop(&mut self) {
        // An interrupted send did not happen: reclaim the parked item so no
        // receiver observes it.
        if let Some(slot) = &self.slot {
            if !slot.taken.get() {
                slot.item.borrow_mut().take();
                slot.taken.set(true);
            }
        }
    }
}

struct RecvFuture<T> {
    chan: Rc<ChannelState<T>>,
}

impl<T> Future for RecvFuture<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(item) = self.chan.pop_item() {
            return Poll::Ready(Ok(item));
        }
        if self.chan.closed.get() {
            return Poll::Ready(Err(RecvError::Closed));
        }
        let mut wakers = self.chan.recv_wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push_back(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use pretty_assertions::assert_eq;

    #[test]
    fn try_send_and_receive() {
        let rt = Runtime::with_test_clock();
        let chan = Channel::<i32>::bounded(2);
        let program = chan
            .try_send(1)
            .then(chan.try_send(2))
            .then(chan.try_receive().map_error(|_| TrySendError::Closed(0)))
            .zip(chan.try_receive().map_error(|_| TrySendError::Closed(0)));
        assert_eq!(rt.run(program), Exit::Success((1, 2)));
    }

    #[test]
    fn try_send_reports_full() {
        let rt = Runtime::with_test_clock();
        let chan = Channel::<i32>::bounded(1);
        let program = chan
            .try_send(1)
            .then(chan.try_send(2))
            .either::<TrySendError<i32>>();
        assert_eq!(
            rt.run(program),
            Exit::Success(Err(TrySendError::Full(2)))
        );
    }

    #[test]
    fn close_keeps_buffered_items_receivable() {
        let rt = Runtime::with_test_clock();
        let chan = Channel::<i32>::bounded(4);
        let program = chan
            .try_send(7)
            .map_error(|_| RecvError::Closed)
            .then(chan.close())
            .then(chan.receive())
            .zip(chan.receive().either())
            .map(|(first, second)| (first, second));
        assert_eq!(
            rt.run(program),
            Exit::Success((7, Err(RecvError::Closed)))
        );
    }

    #[test]
    fn send_after_close_returns_item() {
        let rt = Runtime::with_test_clock();
        let chan = Channel::<String>::bounded(1);
        let program = chan
            .close::<SendError<String>>()
            .then(chan.send("lost".to_owned()))
            .either::<SendError<String>>();
        assert_eq!(
            rt.run(program),
            Exit::Success(Err(SendError::Closed("lost".to_owned())))
        );
    }

    #[test]
    fn rendezvous_hands_item_to_receiver() {
        let rt = Runtime::with_test_clock();
        let chan = Channel::<i32>::bounded(0);
        let recv_side = chan.receive().map_error(|e| format!("recv: {e}"));
        let send_side = chan.send(42).map_error(|e| format!("send: {e}"));
        let program = recv_side
            .fork()
            .flat_map(move |receiver| send_side.clone().then(receiver.join()));
        assert_eq!(rt.run(program), Exit::Success(42));
    }
}
