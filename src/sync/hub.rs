//! One-to-many broadcast with per-subscriber backpressure.
//!
//! Every subscriber owns a bounded channel of the hub's capacity; a publish
//! delivers a clone of the item to each live subscriber in subscription
//! order, suspending on any subscriber that is full. Dropping a
//! [`Subscription`] closes its channel, and the hub prunes it on the next
//! publish.

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;

use crate::channel::{Channel, RecvError, TryRecvError};
use crate::effect::Effect;
use crate::exit::Exit;

struct HubState<T> {
    capacity: usize,
    subscribers: RefCell<Vec<Channel<T>>>,
}

/// Broadcast hub. Cloning shares the same hub.
pub struct Hub<T> {
    state: Rc<HubState<T>>,
}

impl<T> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Hub<T> {
    /// A hub whose subscribers buffer at most `capacity` items each.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::new(HubState {
                capacity,
                subscribers: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.state.subscribers.borrow_mut();
        subscribers.retain(|chan| !chan.is_closed());
        subscribers.len()
    }
}

impl<T: Clone + 'static> Hub<T> {
    /// Registers a new subscriber. It sees items published after this call.
    pub fn subscribe<E: 'static>(&self) -> Effect<Subscription<T>, E> {
        let hub = self.clone();
        Effect::new(move |_| {
            let hub = hub.clone();
            async move {
                let chan = Channel::bounded(hub.state.capacity);
                hub.state.subscribers.borrow_mut().push(chan.clone());
                Exit::Success(Subscription { chan })
            }
            .boxed_local()
        })
    }

    /// Delivers the item to every live subscriber, suspending on full ones.
    /// Closed subscribers are pruned.
    pub fn publish<E: 'static>(&self, item: T) -> Effect<(), E> {
        let hub = self.clone();
        Effect::new(move |env| {
            let hub = hub.clone();
            let item = item.clone();
            async move {
                let subscribers: Vec<Channel<T>> =
                    hub.state.subscribers.borrow().iter().cloned().collect();
                for chan in subscribers {
                    if chan.is_closed() {
                        continue;
                    }
                    match chan.send(item.clone()).eval(env.clone()).await {
                        Exit::Success(()) => {}
                        Exit::Failure(cause) => {
                            if cause.first_failure().is_none() {
                                // interruption or defect, not a closed subscriber
                                return Exit::Failure(cause.cast_failures_absent());
                            }
                        }
                    }
                }
                hub.state
                    .subscribers
                    .borrow_mut()
                    .retain(|chan| !chan.is_closed());
                Exit::Success(())
            }
            .boxed_local()
        })
    }
}

/// A subscriber's receiving half. Dropping it unsubscribes.
pub struct Subscription<T> {
    chan: Channel<T>,
}

impl<T: Clone + 'static> Subscription<T> {
    pub fn receive(&self) -> Effect<T, RecvError> {
        self.chan.receive()
    }

    pub fn try_receive(&self) -> Effect<T, TryRecvError> {
        self.chan.try_receive()
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chan.is_empty()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.chan.close_now();
    }
}
