//! The service container: an immutable, type-indexed dictionary of services.
//!
//! Services are keyed by their Rust type. [`Context::add`] is copy-on-write
//! and returns a new container, so contexts can be shared freely between
//! fibers. A missing lookup through the effect-level accessor
//! [`Effect::service`](crate::Effect::service) is a defect.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::rc::Rc;

/// Immutable mapping from service type to service instance.
#[derive(Clone, Default)]
pub struct Context {
    services: Rc<HashMap<TypeId, Rc<dyn Any>>>,
}

impl Context {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new context with `service` registered under its type,
    /// replacing any previous instance of the same type. `self` is not
    /// mutated.
    pub fn add<T: 'static>(&self, service: T) -> Self {
        let mut services: HashMap<_, _> = (*self.services).clone();
        services.insert(TypeId::of::<T>(), Rc::new(service) as Rc<dyn Any>);
        Self {
            services: Rc::new(services),
        }
    }

    /// Looks up a service by type.
    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    #[inline]
    pub fn contains<T: 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Merges two contexts; on key conflict the entry from `other` wins.
    pub fn merge(&self, other: &Context) -> Self {
        let mut services: HashMap<_, _> = (*self.services).clone();
        for (k, v) in other.services.iter() {
            services.insert(*k, v.clone());
        }
        Self {
            services: Rc::new(services),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, PartialEq)]
    struct Port(u16);

    #[derive(Debug, PartialEq)]
    struct Host(String);

    #[test]
    fn add_does_not_mutate_the_original() {
        let base = Context::new();
        let extended = base.add(Port(8080));
        assert!(base.get::<Port>().is_none());
        assert_eq!(extended.get::<Port>().unwrap().0, 8080);
    }

    #[test]
    fn later_add_replaces_earlier() {
        let ctx = Context::new().add(Port(1)).add(Port(2));
        assert_eq!(ctx.get::<Port>().unwrap().0, 2);
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn merge_is_right_biased() {
        let left = Context::new().add(Port(1)).add(Host("a".into()));
        let right = Context::new().add(Port(2));
        let merged = left.merge(&right);
        assert_eq!(merged.get::<Port>().unwrap().0, 2);
        assert_eq!(merged.get::<Host>().unwrap().0, "a");
    }
}
