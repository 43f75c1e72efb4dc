//! Layers: composable, scoped construction of service environments.
//!
//! A layer is a build function from a base [`Context`] and a [`Scope`] to an
//! extended context, registering every teardown it acquires on the scope.
//! Layers compose sequentially with `+` (the right side sees the left
//! side's outputs) and in parallel with `|` (independent builds against the
//! same scope; on key conflict the right side wins). On a partial failure
//! the finalizers of every successfully-built sub-layer are already
//! registered, so closing the scope releases them before the error
//! propagates; [`Effect::provide`] does exactly that.

use std::convert::Infallible;
use std::fmt;
use std::ops::{Add, BitOr};
use std::rc::Rc;

use futures::FutureExt;

use crate::context::Context;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::par::zip_par;
use crate::scope::Scope;

/// A scoped builder of service containers.
pub struct Layer<E> {
    build: Rc<dyn Fn(Context, Scope) -> Effect<Context, E>>,
}

impl<E> Clone for Layer<E> {
    fn clone(&self) -> Self {
        Self {
            build: self.build.clone(),
        }
    }
}

impl<E: 'static> Layer<E> {
    /// A layer from a raw build function.
    pub fn from_fn(build: impl Fn(Context, Scope) -> Effect<Context, E> + 'static) -> Self {
        Self {
            build: Rc::new(build),
        }
    }

    /// A layer adding an already-constructed service.
    pub fn succeed<T: Clone + 'static>(service: T) -> Self {
        Self::from_fn(move |ctx, _scope| Effect::succeed(ctx.add(service.clone())))
    }

    /// A layer building its service effectfully from the incoming context,
    /// with no teardown.
    pub fn from_effect<T: Clone + 'static>(
        f: impl Fn(Context) -> Effect<T, E> + 'static,
    ) -> Self {
        Self::from_fn(move |ctx, _scope| {
            f(ctx.clone()).map(move |service| ctx.add(service))
        })
    }

    /// A layer acquiring its service and registering the release on the
    /// build scope. The acquisition is uninterruptible.
    pub fn scoped<T: Clone + 'static>(
        acquire: impl Fn(Context) -> Effect<T, E> + 'static,
        release: impl Fn(T) -> Effect<(), Infallible> + 'static,
    ) -> Self {
        let release = Rc::new(release);
        Self::from_fn(move |ctx, scope| {
            let release = release.clone();
            let built = acquire(ctx.clone()).flat_map(move |service| {
                let finalizer = release(service.clone());
                scope
                    .add_finalizer(finalizer)
                    .widen()
                    .map(move |()| service.clone())
            });
            built
                .map(move |service| ctx.add(service))
                .uninterruptible()
        })
    }

    /// The primary build operator: extends `base`, registering teardowns on
    /// `scope`.
    pub fn build_scoped(&self, base: Context, scope: Scope) -> Effect<Context, E> {
        (self.build)(base, scope)
    }

    /// Sequential composition: the right layer sees the left layer's
    /// outputs. If the right build fails, the left releases stay scheduled
    /// on the scope.
    pub fn and_then(self, right: Layer<E>) -> Layer<E> {
        let left = self;
        Layer::from_fn(move |ctx, scope| {
            let right = right.clone();
            let scope2 = scope.clone();
            left.build_scoped(ctx, scope)
                .flat_map(move |ctx| right.build_scoped(ctx, scope2.clone()))
        })
    }
}

impl<E: Clone + fmt::Debug + 'static> Layer<E> {
    /// Parallel composition: independent builds against the same scope; the
    /// right side's keys win on conflict. On partial failure both partial
    /// builds' finalizers are on the scope before the composite fails.
    pub fn par(self, right: Layer<E>) -> Layer<E> {
        let left = self;
        Layer::from_fn(move |ctx, scope| {
            let built_left = left.build_scoped(ctx.clone(), scope.clone());
            let built_right = right.build_scoped(ctx, scope);
            zip_par(built_left, built_right).map(|(l, r)| l.merge(&r))
        })
    }
}

impl<E: 'static> Add for Layer<E> {
    type Output = Layer<E>;

    fn add(self, rhs: Layer<E>) -> Layer<E> {
        self.and_then(rhs)
    }
}

impl<E: Clone + fmt::Debug + 'static> BitOr for Layer<E> {
    type Output = Layer<E>;

    fn bitor(self, rhs: Layer<E>) -> Layer<E> {
        self.par(rhs)
    }
}

////////////////////////////////////////////////////////////////////////////////
// provide
////////////////////////////////////////////////////////////////////////////////

impl<A: 'static, E: 'static> Effect<A, E> {
    /// Builds the layer in a fresh scope, runs the computation under the
    /// resulting context (and with that scope current), and tears the scope
    /// down on completion. On a build failure, everything already built is
    /// released before the failure propagates.
    pub fn provide(self, layer: Layer<E>) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            let layer = layer.clone();
            async move {
                let scope = Scope::new();
                let built = layer
                    .build_scoped(env.ctx.clone(), scope.clone())
                    .eval(env.clone())
                    .await;
                let exit = match built {
                    Exit::Success(ctx) => {
                        let inner_env = env.with_ctx(ctx).with_scope(scope.clone());
                        this.eval(inner_env).await
                    }
                    Exit::Failure(cause) => Exit::Failure(cause),
                };
                let close_exit = scope.close().eval(env).await;
                exit.with_finalizer_exit(close_exit)
            }
            .boxed_local()
        })
    }

    /// Builds the layer into the *current* scope: the services live until
    /// the ambient scope closes.
    pub fn provide_scoped(self, layer: Layer<E>) -> Effect<A, E> {
        Effect::new(move |env| {
            let this = self.clone();
            let layer = layer.clone();
            async move {
                let built = layer
                    .build_scoped(env.ctx.clone(), env.scope.clone())
                    .eval(env.clone())
                    .await;
                match built {
                    Exit::Success(ctx) => this.eval(env.with_ctx(ctx)).await,
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            }
            .boxed_local()
        })
    }
}
