//! The cause algebra: a composable description of how a computation ended
//! abnormally.
//!
//! A [`Cause`] is a tree. Its leaves are the three kinds of abnormal outcome:
//! a typed failure ([`Cause::Fail`]), a defect ([`Cause::Die`]) and a
//! cooperative cancellation ([`Cause::Interrupt`]). Inner nodes record how
//! causes arose relative to each other: [`Cause::Then`] for sequential
//! composition (the right cause arose after the left one, e.g. a finalizer
//! defect after the primary failure) and [`Cause::Both`] for causes produced
//! by concurrent branches. [`Cause::Annotated`] attaches a contextual note
//! and is transparent to all kind queries.

use crate::fiber::FiberId;

////////////////////////////////////////////////////////////////////////////////
// Defect
////////////////////////////////////////////////////////////////////////////////

/// An unexpected error: a bug, a violated invariant, a panic in user code.
///
/// Defects travel on their own channel ([`Cause::Die`]) and are not caught by
/// typed recovery such as [`Effect::catch_all`](crate::Effect::catch_all).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Defect {
    message: String,
}

impl Defect {
    #[inline]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Builds a defect from a panic payload, extracting the message if the
    /// payload is a string.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_owned()
        };
        Self { message }
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for Defect {
    #[inline]
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Defect {
    #[inline]
    fn from(message: String) -> Self {
        Self { message }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Cause
////////////////////////////////////////////////////////////////////////////////

/// A tree describing why a computation ended abnormally.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// A typed, expected failure on the declared error channel.
    Fail(E),
    /// An unexpected defect, e.g. a panic in a user thunk.
    Die(Defect),
    /// Cooperative cancellation, optionally recording the interrupting fiber.
    Interrupt(Option<FiberId>),
    /// Sequential composition: the right cause arose after the left one.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Concurrent composition: both causes arose independently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
    /// A contextual note; transparent to all kind queries.
    Annotated(Box<Cause<E>>, String),
}

impl<E> Cause<E> {
    #[inline]
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Die(defect.into())
    }

    #[inline]
    pub fn interrupt(by: Option<FiberId>) -> Self {
        Self::Interrupt(by)
    }

    #[inline]
    pub fn then(left: Cause<E>, right: Cause<E>) -> Self {
        Self::Then(Box::new(left), Box::new(right))
    }

    #[inline]
    pub fn both(left: Cause<E>, right: Cause<E>) -> Self {
        Self::Both(Box::new(left), Box::new(right))
    }

    #[inline]
    pub fn annotated(self, note: impl Into<String>) -> Self {
        Self::Annotated(Box::new(self), note.into())
    }

    /// `true` if any leaf is a typed failure.
    pub fn is_fail(&self) -> bool {
        self.fold_leaves(false, &mut |acc, leaf| acc || matches!(leaf, Cause::Fail(_)))
    }

    /// `true` if any leaf is a defect.
    pub fn is_die(&self) -> bool {
        self.fold_leaves(false, &mut |acc, leaf| acc || matches!(leaf, Cause::Die(_)))
    }

    /// `true` if any leaf is an interruption.
    pub fn is_interrupt(&self) -> bool {
        self.fold_leaves(false, &mut |acc, leaf| {
            acc || matches!(leaf, Cause::Interrupt(_))
        })
    }

    /// `true` if the cause consists of interruptions only. Such a cause is
    /// absorbed when it belongs to a sibling that was cancelled because of
    /// another branch's failure.
    pub fn is_interrupt_only(&self) -> bool {
        self.fold_leaves(true, &mut |acc, leaf| {
            acc && matches!(leaf, Cause::Interrupt(_))
        })
    }

    /// Folds over the leaves in their temporal (left-to-right) order,
    /// skipping annotation wrappers.
    pub fn fold_leaves<'a, B>(&'a self, init: B, f: &mut impl FnMut(B, &'a Cause<E>) -> B) -> B {
        match self {
            Cause::Then(l, r) | Cause::Both(l, r) => {
                let acc = l.fold_leaves(init, f);
                r.fold_leaves(acc, f)
            }
            Cause::Annotated(inner, _) => inner.fold_leaves(init, f),
            leaf => f(init, leaf),
        }
    }

    /// All typed failures, in temporal order.
    pub fn failures(&self) -> Vec<&E> {
        self.fold_leaves(Vec::new(), &mut |mut acc, leaf| {
            if let Cause::Fail(e) = leaf {
                acc.push(e);
            }
            acc
        })
    }

    /// All defects, in temporal order.
    pub fn defects(&self) -> Vec<&Defect> {
        self.fold_leaves(Vec::new(), &mut |mut acc, leaf| {
            if let Cause::Die(d) = leaf {
                acc.push(d);
            }
            acc
        })
    }

    /// The first typed failure, if the cause is retryable: annotations are
    /// stripped, but any defect or interruption anywhere in the tree makes
    /// the cause non-retryable.
    pub(crate) fn retryable_failure(&self) -> Option<&E> {
        if self.is_die() || self.is_interrupt() {
            return None;
        }
        self.failures().into_iter().next()
    }

    /// The first typed failure in temporal order, if any.
    pub(crate) fn first_failure(&self) -> Option<&E> {
        self.failures().into_iter().next()
    }

    /// Converts the error type of a cause that holds no `Fail` leaves.
    /// Callers must have checked `first_failure().is_none()` first.
    pub(crate) fn cast_failures_absent<E2>(self) -> Cause<E2> {
        self.map(&|_| unreachable!("cause unexpectedly contains typed failures"))
    }

    /// Squashes the tree to a single representative leaf: the first typed
    /// failure if there is one, otherwise the first defect, otherwise an
    /// interruption.
    pub fn squash(&self) -> Cause<E>
    where
        E: Clone,
    {
        if let Some(e) = self.failures().into_iter().next() {
            return Cause::Fail(e.clone());
        }
        if let Some(d) = self.defects().into_iter().next() {
            return Cause::Die(d.clone());
        }
        let by = self.fold_leaves(None, &mut |acc: Option<Option<FiberId>>, leaf| {
            acc.or(match leaf {
                Cause::Interrupt(by) => Some(*by),
                _ => None,
            })
        });
        Cause::Interrupt(by.flatten())
    }

    /// Transforms every typed failure in the tree.
    pub fn map<E2>(self, f: &impl Fn(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Fail(e) => Cause::Fail(f(e)),
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(by) => Cause::Interrupt(by),
            Cause::Then(l, r) => Cause::then(l.map(f), r.map(f)),
            Cause::Both(l, r) => Cause::both(l.map(f), r.map(f)),
            Cause::Annotated(inner, note) => inner.map(f).annotated(note),
        }
    }

    /// Renders the tree as an indented multi-line string, including
    /// annotations.
    pub fn pretty_render(&self) -> String
    where
        E: std::fmt::Debug,
    {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize)
    where
        E: std::fmt::Debug,
    {
        let pad = "  ".repeat(depth);
        match self {
            Cause::Fail(e) => {
                out.push_str(&format!("{pad}fail: {e:?}\n"));
            }
            Cause::Die(d) => {
                out.push_str(&format!("{pad}die: {d}\n"));
            }
            Cause::Interrupt(Some(by)) => {
                out.push_str(&format!("{pad}interrupt: by {by}\n"));
            }
            Cause::Interrupt(None) => {
                out.push_str(&format!("{pad}interrupt\n"));
            }
            Cause::Then(l, r) => {
                out.push_str(&format!("{pad}sequential:\n"));
                l.render_into(out, depth + 1);
                r.render_into(out, depth + 1);
            }
            Cause::Both(l, r) => {
                out.push_str(&format!("{pad}concurrent:\n"));
                l.render_into(out, depth + 1);
                r.render_into(out, depth + 1);
            }
            Cause::Annotated(inner, note) => {
                out.push_str(&format!("{pad}note: {note}\n"));
                inner.render_into(out, depth + 1);
            }
        }
    }
}

impl Cause<std::convert::Infallible> {
    /// An infallible cause holds no typed failures, so it embeds into any
    /// error channel.
    pub fn widen<E>(self) -> Cause<E> {
        self.map(&|never| match never {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_queries_see_through_annotations() {
        let cause = Cause::Fail("boom").annotated("while connecting");
        assert!(cause.is_fail());
        assert!(!cause.is_die());
        assert!(!cause.is_interrupt());
    }

    #[test]
    fn interrupt_only_detection() {
        let pure = Cause::<&str>::both(Cause::Interrupt(None), Cause::Interrupt(None));
        assert!(pure.is_interrupt_only());

        let mixed = Cause::both(Cause::Interrupt(None), Cause::Fail("x"));
        assert!(!mixed.is_interrupt_only());
        assert!(mixed.is_interrupt());
    }

    #[test]
    fn squash_prefers_typed_failures() {
        let cause = Cause::then(
            Cause::Die(Defect::new("bug")),
            Cause::both(Cause::Interrupt(None), Cause::Fail("late")),
        );
        assert_eq!(cause.squash(), Cause::Fail("late"));

        let no_fail = Cause::<&str>::then(Cause::Interrupt(None), Cause::Die(Defect::new("bug")));
        assert_eq!(no_fail.squash(), Cause::Die(Defect::new("bug")));
    }

    #[test]
    fn fold_leaves_in_temporal_order() {
        let cause = Cause::then(
            Cause::Fail(1),
            Cause::both(Cause::Fail(2), Cause::Fail(3)).annotated("fanout"),
        );
        let seen = cause.fold_leaves(Vec::new(), &mut |mut acc, leaf| {
            if let Cause::Fail(n) = leaf {
                acc.push(*n);
            }
            acc
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn pretty_render_includes_annotations() {
        let cause = Cause::Fail("boom").annotated("request 7");
        let rendered = cause.pretty_render();
        assert!(rendered.contains("note: request 7"));
        assert!(rendered.contains("fail: \"boom\""));
    }

    #[test]
    fn retryable_failure_rejects_defects() {
        assert_eq!(Cause::Fail("e").retryable_failure(), Some(&"e"));
        let with_die = Cause::both(Cause::Fail("e"), Cause::Die(Defect::new("bug")));
        assert_eq!(with_die.retryable_failure(), None);
    }
}
