//! Concurrency primitives consumed by the rest of the runtime: the
//! single-assignment [`Deferred`](deferred::Deferred), the mutable
//! [`Ref`](cell::Ref), the unbounded [`Queue`](queue::Queue) and the
//! broadcast [`Hub`](hub::Hub).

pub mod cell;
pub mod deferred;
pub mod hub;
pub mod queue;
