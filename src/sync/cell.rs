//! A mutable cell with atomic update and compare-and-set, usable from many
//! fibers. On the single-threaded runtime "atomic" means the whole update
//! happens between suspension points.

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;

use crate::effect::Effect;
use crate::exit::Exit;

/// A shared mutable cell.
pub struct Ref<T> {
    cell: Rc<RefCell<T>>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T: 'static> Ref<T> {
    pub fn new(value: T) -> Self {
        Self {
            cell: Rc::new(RefCell::new(value)),
        }
    }

    /// Reads the current value without suspending.
    pub fn get_now(&self) -> T
    where
        T: Clone,
    {
        self.cell.borrow().clone()
    }

    pub fn get<E: 'static>(&self) -> Effect<T, E>
    where
        T: Clone,
    {
        let this = self.clone();
        Effect::new(move |_| {
            let this = this.clone();
            async move { Exit::Success(this.cell.borrow().clone()) }.boxed_local()
        })
    }

    pub fn set<E: 'static>(&self, value: T) -> Effect<(), E>
    where
        T: Clone,
    {
        let this = self.clone();
        Effect::new(move |_| {
            let this = this.clone();
            let value = value.clone();
            async move {
                *this.cell.borrow_mut() = value;
                Exit::Success(())
            }
            .boxed_local()
        })
    }

    /// Applies `f` to the current value, storing and yielding the result.
    pub fn update<E: 'static>(&self, f: impl Fn(T) -> T + 'static) -> Effect<T, E>
    where
        T: Clone,
    {
        let this = self.clone();
        let f = Rc::new(f);
        Effect::new(move |_| {
            let this = this.clone();
            let f = f.clone();
            async move {
                let next = f(this.cell.borrow().clone());
                *this.cell.borrow_mut() = next.clone();
                Exit::Success(next)
            }
            .boxed_local()
        })
    }

    /// Applies `f`, storing the new value and yielding the extracted `B`.
    pub fn modify<B: 'static, E: 'static>(
        &self,
        f: impl Fn(T) -> (B, T) + 'static,
    ) -> Effect<B, E>
    where
        T: Clone,
    {
        let this = self.clone();
        let f = Rc::new(f);
        Effect::new(move |_| {
            let this = this.clone();
            let f = f.clone();
            async move {
                let (out, next) = f(this.cell.borrow().clone());
                *this.cell.borrow_mut() = next;
                Exit::Success(out)
            }
            .boxed_local()
        })
    }

    /// Stores `new` only if the current value equals `expected`; yields
    /// whether the swap happened.
    pub fn compare_and_set<E: 'static>(&self, expected: T, new: T) -> Effect<bool, E>
    where
        T: Clone + PartialEq,
    {
        let this = self.clone();
        Effect::new(move |_| {
            let this = this.clone();
            let expected = expected.clone();
            let new = new.clone();
            async move {
                let mut slot = this.cell.borrow_mut();
                if *slot == expected {
                    *slot = new;
                    Exit::Success(true)
                } else {
                    Exit::Success(false)
                }
            }
            .boxed_local()
        })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ref").field(&self.cell.borrow()).finish()
    }
}
