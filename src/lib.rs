//! Structured concurrency runtime with typed failure channels.
//!
//! This library provides a value type, [`Effect`], representing a deferred,
//! environment-dependent asynchronous computation with a three-channel
//! outcome (value, typed failure, defect, interruption), together with the
//! machinery to compose, supervise, recover, retry and observe such
//! computations:
//!
//! - [Cause algebra](cause) and [`Exit`]: how and why a computation ended
//! - [`Context`]: an immutable type-indexed service container
//! - [`Scope`](scope::Scope): LIFO resource release
//! - [Fibers](fiber): forkable units of work with identity, join and
//!   cooperative interruption
//! - [Parallel combinators](par) with strict cancellation-on-failure
//! - [`Schedule`](schedule::Schedule): the retry/repeat decision automaton
//! - [`Layer`](layer::Layer): scoped construction of service environments
//! - [Channels](channel) and [pipelines](pipeline): backpressured queues
//!   and multi-stage worker pools
//! - [Synchronization primitives](sync): deferred, ref, fiber-local,
//!   queue, hub
//! - [Injected services](service): clock, random, logger, metrics, tracer
//!
//! Everything runs on a single-threaded cooperative executor owned by a
//! [`Runtime`]; see the [runtime](mod@runtime) module for the scheduling
//! model.
//!
//! ```no_run
//! use strand::{Effect, Exit, Runtime};
//!
//! let program = Effect::<i32, String>::succeed(10)
//!     .map(|x| x * 2)
//!     .flat_map(|x| Effect::succeed(x + 3));
//! assert!(matches!(Runtime::new().run(program), Exit::Success(23)));
//! ```

pub mod cause;
pub mod channel;
pub mod context;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod layer;
pub mod par;
pub mod pipeline;
pub mod runtime;
pub mod schedule;
pub mod scope;
pub mod service;
pub mod sync;

pub use cause::{Cause, Defect};
pub use context::Context;
pub use effect::{Effect, Restore};
pub use exit::Exit;
pub use fiber::{Fiber, FiberId, FiberLocal, FiberStatus};
pub use layer::Layer;
pub use par::{for_each_par, merge_all, race, race_all, race_first, zip_par};
pub use runtime::{FiberOutcome, Runtime, Supervisor};
pub use schedule::{Decision, Schedule};
pub use scope::Scope;
pub use sync::cell::Ref;
pub use sync::deferred::Deferred;
pub use sync::hub::Hub;
pub use sync::queue::Queue;
