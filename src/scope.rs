//! Scopes: ordered registries of release actions.
//!
//! A scope collects finalizers as resources are acquired and releases them
//! in reverse order when closed. Every finalizer is attempted; failures are
//! aggregated into a single cause reported by the close result. A scope is
//! single-use: once closed, registering another finalizer runs it
//! immediately.

use std::cell::RefCell;
use std::convert::Infallible;
use std::rc::Rc;

use futures::FutureExt;

use crate::cause::Cause;
use crate::effect::{run_finalizer, Effect};
use crate::exit::Exit;

#[derive(Default)]
struct ScopeInner {
    finalizers: Vec<Effect<(), Infallible>>,
    closed: bool,
}

/// A LIFO registry of finalizers.
#[derive(Clone, Default)]
pub struct Scope {
    inner: Rc<RefCell<ScopeInner>>,
}

impl Scope {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Number of finalizers currently registered.
    pub fn len(&self) -> usize {
        self.inner.borrow().finalizers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().finalizers.is_empty()
    }

    /// Registers `finalizer` to run when the scope closes. If the scope is
    /// already closed the finalizer runs immediately, and the returned
    /// effect carries its outcome.
    pub fn add_finalizer(&self, finalizer: Effect<(), Infallible>) -> Effect<(), Infallible> {
        let scope = self.clone();
        Effect::new(move |env| {
            let scope = scope.clone();
            let finalizer = finalizer.clone();
            async move {
                let run_now = {
                    let mut inner = scope.inner.borrow_mut();
                    if inner.closed {
                        true
                    } else {
                        inner.finalizers.push(finalizer.clone());
                        false
                    }
                };
                if run_now {
                    run_finalizer(env, finalizer).await
                } else {
                    Exit::Success(())
                }
            }
            .boxed_local()
        })
    }

    /// Creates a child scope whose close is registered as a finalizer of
    /// this scope, so closing the parent closes the child first.
    pub fn child(&self) -> Effect<Scope, Infallible> {
        let parent = self.clone();
        Effect::new(move |env| {
            let parent = parent.clone();
            async move {
                let child = Scope::new();
                match parent.add_finalizer(child.close()).eval(env).await {
                    Exit::Success(()) => Exit::Success(child),
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            }
            .boxed_local()
        })
    }

    /// Releases every finalizer in reverse insertion order. Each finalizer
    /// runs in an uninterruptible region regardless of earlier failures;
    /// their causes are aggregated sequentially into the close result.
    pub fn close(&self) -> Effect<(), Infallible> {
        let scope = self.clone();
        Effect::new(move |env| {
            let scope = scope.clone();
            async move {
                let finalizers = {
                    let mut inner = scope.inner.borrow_mut();
                    inner.closed = true;
                    std::mem::take(&mut inner.finalizers)
                };
                let mut result: Exit<(), Infallible> = Exit::Success(());
                for finalizer in finalizers.into_iter().rev() {
                    let fin_exit = run_finalizer(env.clone(), finalizer).await;
                    result = append_failure(result, fin_exit);
                }
                result
            }
            .boxed_local()
        })
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Scope")
            .field("finalizers", &inner.finalizers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Appends a later failure to an accumulated close result, preserving
/// temporal order.
fn append_failure(
    acc: Exit<(), Infallible>,
    next: Exit<(), Infallible>,
) -> Exit<(), Infallible> {
    match next {
        Exit::Success(()) => acc,
        Exit::Failure(later) => match acc {
            Exit::Success(()) => Exit::Failure(later),
            Exit::Failure(earlier) => Exit::Failure(Cause::then(earlier, later)),
        },
    }
}
