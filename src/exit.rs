//! The outcome of running a computation: a success value or a [`Cause`].

use crate::cause::Cause;

/// Tagged sum of a success value and the cause of an abnormal end.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    Success(A),
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    #[inline]
    pub fn fail(e: E) -> Self {
        Self::Failure(Cause::Fail(e))
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// `true` if the exit is a failure whose cause is interruption only.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(cause) => cause.is_interrupt_only(),
        }
    }

    pub fn fold<B>(self, on_cause: impl FnOnce(Cause<E>) -> B, on_value: impl FnOnce(A) -> B) -> B {
        match self {
            Self::Success(a) => on_value(a),
            Self::Failure(cause) => on_cause(cause),
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(a) => Exit::Success(f(a)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    pub fn map_cause<E2>(self, f: impl FnOnce(Cause<E>) -> Cause<E2>) -> Exit<A, E2> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(cause) => Exit::Failure(f(cause)),
        }
    }

    pub fn value(self) -> Option<A> {
        match self {
            Self::Success(a) => Some(a),
            Self::Failure(_) => None,
        }
    }

    pub fn cause(self) -> Option<Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Converts to a `Result`, squashing the cause to its representative
    /// typed failure when there is one.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(a) => Ok(a),
            Self::Failure(cause) => Err(cause),
        }
    }

    /// Combines the primary exit with a finalizer's exit: the finalizer ran
    /// after the primary computation, so its cause attaches with `Then`.
    pub(crate) fn with_finalizer_exit(self, finalizer: Exit<(), std::convert::Infallible>) -> Self {
        match finalizer {
            Exit::Success(()) => self,
            Exit::Failure(fin_cause) => {
                let fin_cause = fin_cause.widen();
                match self {
                    Self::Success(_) => Self::Failure(fin_cause),
                    Self::Failure(primary) => Self::Failure(Cause::then(primary, fin_cause)),
                }
            }
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(res: Result<A, E>) -> Self {
        match res {
            Ok(a) => Self::Success(a),
            Err(e) => Self::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Defect;
    use pretty_assertions::assert_eq;

    #[test]
    fn fold_dispatches() {
        let ok: Exit<i32, &str> = Exit::Success(5);
        assert_eq!(ok.fold(|_| 0, |a| a + 1), 6);

        let bad: Exit<i32, &str> = Exit::fail("nope");
        assert_eq!(bad.fold(|c| c.failures().len() as i32, |_| 0), 1);
    }

    #[test]
    fn finalizer_cause_attaches_sequentially() {
        let primary: Exit<(), &str> = Exit::fail("boom");
        let fin = Exit::Failure(Cause::die(Defect::new("cleanup bug")));
        let combined = primary.with_finalizer_exit(fin);
        match combined {
            Exit::Failure(Cause::Then(l, r)) => {
                assert!(l.is_fail());
                assert!(r.is_die());
            }
            other => panic!("expected sequential cause, got {other:?}"),
        }
    }

    #[test]
    fn finalizer_defect_replaces_success() {
        let primary: Exit<i32, &str> = Exit::Success(1);
        let fin = Exit::Failure(Cause::die(Defect::new("cleanup bug")));
        assert!(primary.with_finalizer_exit(fin).is_failure());
    }
}
