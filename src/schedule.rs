//! Schedules: decision automata driving `retry` and `repeat`.
//!
//! A schedule consumes an input (the error for `retry`, the success value
//! for `repeat`) and decides whether to continue after a delay or halt. The
//! encoding is functional: every decision carries the *next* schedule, so
//! schedules thread their own state and hold no mutable cells. Steps are
//! effects, which lets `jittered` consult the injected `Random` service.

use std::convert::Infallible;
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;

use crate::effect::Effect;
use crate::exit::Exit;
use crate::service::random::RandomService;

/// Outcome of one schedule step.
pub enum Decision<In, Out> {
    Continue {
        delay: Duration,
        output: Out,
        next: Schedule<In, Out>,
    },
    Halt {
        output: Out,
    },
}

impl<In, Out: Clone> Clone for Decision<In, Out> {
    fn clone(&self) -> Self {
        match self {
            Self::Continue {
                delay,
                output,
                next,
            } => Self::Continue {
                delay: *delay,
                output: output.clone(),
                next: next.clone(),
            },
            Self::Halt { output } => Self::Halt {
                output: output.clone(),
            },
        }
    }
}

impl<In, Out: Clone> Decision<In, Out> {
    pub fn output(&self) -> Out {
        match self {
            Self::Continue { output, .. } | Self::Halt { output } => output.clone(),
        }
    }
}

/// A decision automaton from `In` inputs to `Out` outputs.
pub struct Schedule<In, Out> {
    step: Rc<dyn Fn(In) -> Effect<Decision<In, Out>, Infallible>>,
}

impl<In, Out> Clone for Schedule<In, Out> {
    fn clone(&self) -> Self {
        Self {
            step: self.step.clone(),
        }
    }
}

impl<In: Clone + 'static, Out: Clone + 'static> Schedule<In, Out> {
    pub(crate) fn from_step(
        step: impl Fn(In) -> Effect<Decision<In, Out>, Infallible> + 'static,
    ) -> Self {
        Self {
            step: Rc::new(step),
        }
    }

    /// Feeds one input to the automaton.
    pub fn step(&self, input: In) -> Effect<Decision<In, Out>, Infallible> {
        (self.step)(input)
    }

    /// Switches to `other` once `self` halts, feeding it the input that
    /// caused the halt.
    pub fn and_then(self, other: Schedule<In, Out>) -> Schedule<In, Out> {
        let first = self;
        Schedule::from_step(move |input: In| {
            let first = first.clone();
            let other = other.clone();
            first.step(input.clone()).flat_map(move |decision| {
                let other = other.clone();
                match decision {
                    Decision::Continue {
                        delay,
                        output,
                        next,
                    } => Effect::succeed(Decision::Continue {
                        delay,
                        output,
                        next: next.and_then(other),
                    }),
                    Decision::Halt { .. } => other.step(input.clone()),
                }
            })
        })
    }

    /// Halts once the accumulated delay reaches `total`.
    pub fn up_to(self, total: Duration) -> Schedule<In, Out> {
        self.up_to_from(Duration::ZERO, total)
    }

    fn up_to_from(self, accumulated: Duration, total: Duration) -> Schedule<In, Out> {
        let inner = self;
        Schedule::from_step(move |input: In| {
            inner.step(input).map(move |decision| match decision {
                Decision::Continue {
                    delay,
                    output,
                    next,
                } => {
                    let accumulated = accumulated.saturating_add(delay);
                    if accumulated >= total {
                        Decision::Halt { output }
                    } else {
                        Decision::Continue {
                            delay,
                            output,
                            next: next.up_to_from(accumulated, total),
                        }
                    }
                }
                halt => halt,
            })
        })
    }

    /// Halts as soon as the predicate rejects an input. The rejected input
    /// is not recurred on.
    pub fn while_input(self, p: impl Fn(&In) -> bool + 'static) -> Schedule<In, Out> {
        self.while_input_rc(Rc::new(p))
    }

    fn while_input_rc(self, p: Rc<dyn Fn(&In) -> bool>) -> Schedule<In, Out> {
        let inner = self;
        Schedule::from_step(move |input: In| {
            let pass = p(&input);
            let p = p.clone();
            inner.step(input).map(move |decision| match decision {
                Decision::Continue {
                    delay,
                    output,
                    next,
                } if pass => Decision::Continue {
                    delay,
                    output,
                    next: next.while_input_rc(p.clone()),
                },
                Decision::Continue { output, .. } => Decision::Halt { output },
                halt => halt,
            })
        })
    }

    /// Halts as soon as the predicate rejects an output.
    pub fn while_output(self, p: impl Fn(&Out) -> bool + 'static) -> Schedule<In, Out> {
        self.while_output_rc(Rc::new(p))
    }

    fn while_output_rc(self, p: Rc<dyn Fn(&Out) -> bool>) -> Schedule<In, Out> {
        let inner = self;
        Schedule::from_step(move |input: In| {
            let p = p.clone();
            inner.step(input).map(move |decision| match decision {
                Decision::Continue {
                    delay,
                    output,
                    next,
                } => {
                    if p(&output) {
                        Decision::Continue {
                            delay,
                            output,
                            next: next.while_output_rc(p.clone()),
                        }
                    } else {
                        Decision::Halt { output }
                    }
                }
                halt => halt,
            })
        })
    }

    /// Multiplies every delay by a uniform sample from `[low, high)` drawn
    /// from the injected `Random` service.
    pub fn jittered(self, low: f64, high: f64) -> Schedule<In, Out> {
        let inner = self;
        Schedule::from_step(move |input: In| {
            inner.step(input).flat_map(move |decision| match decision {
                Decision::Continue {
                    delay,
                    output,
                    next,
                } => Effect::<RandomService, Infallible>::service().map(move |random| {
                    let factor = (low + (high - low) * random.0.next_double()).max(0.0);
                    Decision::Continue {
                        delay: delay.mul_f64(factor),
                        output: output.clone(),
                        next: next.clone().jittered(low, high),
                    }
                }),
                halt => Effect::succeed(halt),
            })
        })
    }

    /// Transforms the output channel.
    pub fn map_output<Out2: Clone + 'static>(
        self,
        f: impl Fn(Out) -> Out2 + 'static,
    ) -> Schedule<In, Out2> {
        self.map_output_rc(Rc::new(f))
    }

    fn map_output_rc<Out2: Clone + 'static>(
        self,
        f: Rc<dyn Fn(Out) -> Out2>,
    ) -> Schedule<In, Out2> {
        let inner = self;
        Schedule::from_step(move |input: In| {
            let f = f.clone();
            inner.step(input).map(move |decision| match decision {
                Decision::Continue {
                    delay,
                    output,
                    next,
                } => Decision::Continue {
                    delay,
                    output: f(output),
                    next: next.map_output_rc(f.clone()),
                },
                Decision::Halt { output } => Decision::Halt { output: f(output) },
            })
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// Constructors
////////////////////////////////////////////////////////////////////////////////

impl<In: Clone + 'static> Schedule<In, u64> {
    /// Recurs `n` times with no delay; the output counts recurrences so far.
    pub fn recurs(n: u64) -> Self {
        Self::recurs_from(0, n)
    }

    fn recurs_from(done: u64, n: u64) -> Self {
        Schedule::from_step(move |_input: In| {
            let decision = if done < n {
                Decision::Continue {
                    delay: Duration::ZERO,
                    output: done + 1,
                    next: Self::recurs_from(done + 1, n),
                }
            } else {
                Decision::Halt { output: done }
            };
            Effect::succeed(decision)
        })
    }

    /// Recurs forever with a constant delay.
    pub fn spaced(d: Duration) -> Self {
        Self::spaced_from(d, 0)
    }

    fn spaced_from(d: Duration, done: u64) -> Self {
        Schedule::from_step(move |_input: In| {
            Effect::succeed(Decision::Continue {
                delay: d,
                output: done + 1,
                next: Self::spaced_from(d, done + 1),
            })
        })
    }
}

impl<In: Clone + 'static> Schedule<In, Duration> {
    /// Recurs forever with delays `base * factor^k`; the output is the
    /// delay just decided.
    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::exponential_from(base, factor, 0)
    }

    fn exponential_from(base: Duration, factor: f64, k: i32) -> Self {
        Schedule::from_step(move |_input: In| {
            let delay = base.mul_f64(factor.powi(k).max(0.0));
            Effect::succeed(Decision::Continue {
                delay,
                output: delay,
                next: Self::exponential_from(base, factor, k + 1),
            })
        })
    }

    /// Recurs forever with delays following the Fibonacci progression of
    /// `base`.
    pub fn fibonacci(base: Duration) -> Self {
        Self::fibonacci_from(base, base)
    }

    fn fibonacci_from(current: Duration, next_delay: Duration) -> Self {
        Schedule::from_step(move |_input: In| {
            Effect::succeed(Decision::Continue {
                delay: current,
                output: current,
                next: Self::fibonacci_from(next_delay, current.saturating_add(next_delay)),
            })
        })
    }
}

////////////////////////////////////////////////////////////////////////////////
// retry / repeat
////////////////////////////////////////////////////////////////////////////////

impl<A: 'static, E: Clone + 'static> Effect<A, E> {
    /// Re-runs the computation on typed failure, as long as the schedule
    /// continues; sleeps the decided delay between attempts through the
    /// `Clock` service. Defects and interruptions are never retried. When
    /// the schedule halts, the last failure surfaces.
    pub fn retry<Out: Clone + 'static>(self, schedule: Schedule<E, Out>) -> Effect<A, E> {
        Effect::new(move |env| {
            let eff = self.clone();
            let schedule = schedule.clone();
            async move {
                let mut schedule = schedule;
                loop {
                    let cause = match eff.eval(env.clone()).await {
                        Exit::Success(a) => return Exit::Success(a),
                        Exit::Failure(cause) => cause,
                    };
                    let Some(error) = cause.retryable_failure().cloned() else {
                        return Exit::Failure(cause);
                    };
                    match schedule.step(error).eval(env.clone()).await {
                        Exit::Success(Decision::Continue { delay, next, .. }) => {
                            if let Exit::Failure(cause) =
                                Effect::<(), E>::sleep(delay).eval(env.clone()).await
                            {
                                return Exit::Failure(cause);
                            }
                            schedule = next;
                        }
                        Exit::Success(Decision::Halt { .. }) => return Exit::Failure(cause),
                        Exit::Failure(step_cause) => return Exit::Failure(step_cause.widen()),
                    }
                }
            }
            .boxed_local()
        })
    }
}

impl<A: Clone + 'static, E: 'static> Effect<A, E> {
    /// Re-runs the computation on success, as long as the schedule
    /// continues, yielding the final success value. A failure during the
    /// repetitions surfaces immediately.
    pub fn repeat<Out: Clone + 'static>(self, schedule: Schedule<A, Out>) -> Effect<A, E> {
        Effect::new(move |env| {
            let eff = self.clone();
            let schedule = schedule.clone();
            async move {
                let mut schedule = schedule;
                loop {
                    let value = match eff.eval(env.clone()).await {
                        Exit::Success(a) => a,
                        failure => return failure,
                    };
                    match schedule.step(value.clone()).eval(env.clone()).await {
                        Exit::Success(Decision::Continue { delay, next, .. }) => {
                            if let Exit::Failure(cause) =
                                Effect::<(), E>::sleep(delay).eval(env.clone()).await
                            {
                                return Exit::Failure(cause);
                            }
                            schedule = next;
                        }
                        Exit::Success(Decision::Halt { .. }) => return Exit::Success(value),
                        Exit::Failure(step_cause) => return Exit::Failure(step_cause.widen()),
                    }
                }
            }
            .boxed_local()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::service::random::{RandomService, TestRandom};
    use crate::sync::cell::Ref;
    use pretty_assertions::assert_eq;

    fn flaky(fail_times: usize) -> (Ref<usize>, Effect<&'static str, String>) {
        let calls = Ref::new(0usize);
        let counter = calls.clone();
        let eff = counter
            .update::<String>(|n| n + 1)
            .flat_map(move |n| {
                if n <= fail_times {
                    Effect::fail(format!("attempt {n} failed"))
                } else {
                    Effect::succeed("ok")
                }
            });
        (calls, eff)
    }

    #[test]
    fn retry_runs_initial_plus_n_attempts() {
        let rt = Runtime::with_test_clock();
        let (calls, eff) = flaky(10);
        let exit = rt.run(eff.retry(Schedule::recurs(2)));
        assert!(exit.is_failure());
        assert_eq!(calls.get_now(), 3);
    }

    #[test]
    fn retry_succeeds_once_effect_recovers() {
        let rt = Runtime::with_test_clock();
        let (calls, eff) = flaky(2);
        let exit = rt.run(eff.retry(Schedule::recurs(2)));
        assert_eq!(exit, crate::exit::Exit::Success("ok"));
        assert_eq!(calls.get_now(), 3);
    }

    #[test]
    fn repeat_recurs_on_success() {
        let rt = Runtime::with_test_clock();
        let calls = Ref::new(0usize);
        let counter = calls.clone();
        let eff: Effect<usize, String> = counter.update(|n| n + 1);
        let exit = rt.run(eff.repeat(Schedule::recurs(3)));
        assert_eq!(exit, crate::exit::Exit::Success(4));
        assert_eq!(calls.get_now(), 4);
    }

    #[test]
    fn spaced_delays_accumulate_on_the_virtual_clock() {
        let rt = Runtime::with_test_clock();
        let clock = rt.test_clock().unwrap();
        let eff: Effect<(), String> = Effect::unit();
        let exit = rt.run(
            eff.repeat(
                Schedule::spaced(Duration::from_millis(100)).while_output(|count| *count < 3),
            ),
        );
        assert_eq!(exit, crate::exit::Exit::Success(()));
        // Two sleeps happen: the schedule halts at the third decision.
        assert_eq!(clock.now(), Duration::from_millis(200));
    }

    #[test]
    fn jittered_scales_delays_with_injected_random() {
        let rt = Runtime::with_test_clock()
            .with_service(RandomService(Rc::new(TestRandom::new([0.0, 1.0], []))));
        let clock = rt.test_clock().unwrap();
        let (_, eff) = flaky(10);
        let schedule = Schedule::spaced(Duration::from_millis(100))
            .jittered(0.5, 1.5)
            .while_output(|count| *count < 3);
        let exit = rt.run(eff.retry(schedule));
        assert!(exit.is_failure());
        // First delay scaled by 0.5, second by 1.5 (scripted samples), the
        // schedule halts before a third sleep.
        assert_eq!(clock.now(), Duration::from_millis(200));
    }

    #[test]
    fn and_then_switches_after_halt() {
        let rt = Runtime::with_test_clock();
        let (calls, eff) = flaky(100);
        let schedule = Schedule::recurs(1).and_then(Schedule::recurs(2));
        let exit = rt.run(eff.retry(schedule));
        assert!(exit.is_failure());
        // 1 initial + 1 from the first schedule + 2 from the second.
        assert_eq!(calls.get_now(), 4);
    }

    #[test]
    fn exponential_progression() {
        let rt = Runtime::with_test_clock();
        let clock = rt.test_clock().unwrap();
        let (_, eff) = flaky(100);
        let schedule = Schedule::<String, Duration>::exponential(Duration::from_millis(10), 2.0)
            .while_output(|delay| *delay <= Duration::from_millis(40));
        let exit = rt.run(eff.retry(schedule));
        assert!(exit.is_failure());
        // 10 + 20 + 40, halting when the next delay would be 80.
        assert_eq!(clock.now(), Duration::from_millis(70));
    }
}
