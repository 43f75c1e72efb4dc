//! Multi-stage pipelines: worker pools wired over bounded channels.
//!
//! A pipeline is plumbing, not lifecycle: a driver outside the pipeline
//! closes the source channel when production finishes. Workers observe the
//! closed-and-drained inbound channel and exit; when every worker of a
//! stage has exited, the stage's outbound channel closes, letting the next
//! stage drain in turn. A final pump forwards the last internal channel to
//! the caller-supplied output channel, which the pipeline never closes:
//! termination protocol on it belongs to the driver.
//!
//! [`Pipeline::run`] returns only after every forked worker has reached a
//! terminal state. The first stage failure interrupts all other workers and
//! surfaces after they have ceased; interrupting the `run` computation
//! interrupts every worker before `run` completes.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll};

use futures::FutureExt;

use crate::cause::Cause;
use crate::channel::Channel;
use crate::effect::{trap, Effect, Env};
use crate::exit::Exit;
use crate::fiber::{fork_unscoped, interruptible, Fiber};
use crate::sync::deferred::DeferredWait;

struct StageSpec<E> {
    workers: Vec<Effect<(), E>>,
    close_outbound: Rc<dyn Fn()>,
}

/// A chain of transforming stages between an input and an output channel.
pub struct Pipeline<In, Out, E> {
    wire: Rc<dyn Fn(Channel<In>, &mut Vec<StageSpec<E>>) -> Channel<Out>>,
}

impl<In, Out, E> Clone for Pipeline<In, Out, E> {
    fn clone(&self) -> Self {
        Self {
            wire: self.wire.clone(),
        }
    }
}

impl<In: Clone + 'static, E: Clone + fmt::Debug + 'static> Pipeline<In, In, E> {
    /// The empty pipeline: `run` pumps input straight to output.
    pub fn new() -> Self {
        Self {
            wire: Rc::new(|input, _stages| input),
        }
    }
}

impl<In: Clone + 'static, E: Clone + fmt::Debug + 'static> Default for Pipeline<In, In, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out, E> Pipeline<In, Out, E>
where
    In: Clone + 'static,
    Out: Clone + 'static,
    E: Clone + fmt::Debug + 'static,
{
    /// Appends a stage of `workers` concurrent transformers reading from
    /// the previous stage and writing to a new channel of `out_capacity`.
    pub fn stage<Next: Clone + 'static>(
        self,
        f: impl Fn(Out) -> Effect<Next, E> + 'static,
        workers: usize,
        out_capacity: usize,
    ) -> Pipeline<In, Next, E> {
        let f: Rc<dyn Fn(Out) -> Effect<Next, E>> = Rc::new(f);
        let prev = self;
        Pipeline {
            wire: Rc::new(move |input, stages| {
                let inbound = (prev.wire)(input, stages);
                let outbound = Channel::<Next>::bounded(out_capacity);
                let worker_effects = (0..workers)
                    .map(|_| stage_worker(inbound.clone(), outbound.clone(), f.clone()))
                    .collect();
                let close_target = outbound.clone();
                stages.push(StageSpec {
                    workers: worker_effects,
                    close_outbound: Rc::new(move || close_target.close_now()),
                });
                outbound
            }),
        }
    }

    /// Wires the stages between `input` and `output`, forks the workers and
    /// supervises them until every one of them is terminal.
    pub fn run(&self, input: Channel<In>, output: Channel<Out>) -> Effect<(), E> {
        let wire = self.wire.clone();
        Effect::new(move |env| {
            let wire = wire.clone();
            let input = input.clone();
            let output = output.clone();
            async move {
                let mut stages: Vec<StageSpec<E>> = Vec::new();
                let last = (wire)(input, &mut stages);
                if stages.iter().any(|stage| stage.workers.is_empty()) {
                    return Exit::Failure(Cause::die("pipeline stage with zero workers"));
                }

                let me = env.fiber.id();
                let mut all: Vec<Fiber<(), E>> = Vec::new();
                // (stage index, fiber index into `all`)
                let mut entries: Vec<(usize, DeferredWait<Exit<(), E>>)> = Vec::new();
                let mut stage_sizes: Vec<usize> = Vec::new();
                for (index, stage) in stages.iter().enumerate() {
                    stage_sizes.push(stage.workers.len());
                    for worker in &stage.workers {
                        let fiber = fork_unscoped(&env, worker.clone());
                        entries.push((index, fiber.result.future()));
                        all.push(fiber);
                    }
                }
                let pump_index = stages.len();
                let pump_fiber = fork_unscoped(&env, pump(last, output));
                entries.push((pump_index, pump_fiber.result.future()));
                all.push(pump_fiber);

                let mut remaining_per_stage = stage_sizes;
                while !entries.is_empty() {
                    let wait = WaitAny {
                        entries: Some(entries),
                    };
                    match interruptible(&env.fiber, wait).await {
                        Err(by) => {
                            for fiber in &all {
                                fiber.state.signal_interrupt(Some(me));
                            }
                            for fiber in &all {
                                fiber.result.future().await;
                            }
                            return Exit::Failure(Cause::Interrupt(by));
                        }
                        Ok((stage, exit, rest)) => {
                            entries = rest;
                            match exit {
                                Exit::Success(()) => {
                                    if stage < remaining_per_stage.len() {
                                        remaining_per_stage[stage] -= 1;
                                        if remaining_per_stage[stage] == 0 {
                                            (stages[stage].close_outbound)();
                                        }
                                    }
                                }
                                Exit::Failure(mut cause) => {
                                    for fiber in &all {
                                        fiber.state.signal_interrupt(Some(me));
                                    }
                                    for (_, wait) in entries {
                                        let sibling = wait.await;
                                        cause = match sibling {
                                            Exit::Success(()) => cause,
                                            Exit::Failure(c) if c.is_interrupt_only() => cause,
                                            Exit::Failure(c) => Cause::both(cause, c),
                                        };
                                    }
                                    return Exit::Failure(cause);
                                }
                            }
                        }
                    }
                }
                Exit::Success(())
            }
            .boxed_local()
        })
    }
}

/// One worker: drain the inbound channel, transform, forward. A closed and
/// drained inbound channel ends the worker; an outbound channel closed
/// underneath it (shutdown) does too.
fn stage_worker<A, B, E>(
    inbound: Channel<A>,
    outbound: Channel<B>,
    f: Rc<dyn Fn(A) -> Effect<B, E>>,
) -> Effect<(), E>
where
    A: Clone + 'static,
    B: Clone + 'static,
    E: Clone + 'static,
{
    Effect::new(move |env: Env| {
        let inbound = inbound.clone();
        let outbound = outbound.clone();
        let f = f.clone();
        async move {
            loop {
                let item = match inbound.receive().eval(env.clone()).await {
                    Exit::Success(item) => item,
                    Exit::Failure(cause) => {
                        if cause.first_failure().is_some() {
                            return Exit::Success(());
                        }
                        return Exit::Failure(cause.cast_failures_absent());
                    }
                };
                let transformed = match trap(|| f(item)) {
                    Ok(eff) => eff.eval(env.clone()).await,
                    Err(defect) => Exit::Failure(Cause::Die(defect)),
                };
                match transformed {
                    Exit::Success(out) => match outbound.send(out).eval(env.clone()).await {
                        Exit::Success(()) => {}
                        Exit::Failure(cause) => {
                            if cause.first_failure().is_some() {
                                return Exit::Success(());
                            }
                            return Exit::Failure(cause.cast_failures_absent());
                        }
                    },
                    Exit::Failure(cause) => return Exit::Failure(cause),
                }
            }
        }
        .boxed_local()
    })
}

/// Forwards the last internal channel to the caller-supplied output.
fn pump<T, E>(from: Channel<T>, to: Channel<T>) -> Effect<(), E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    Effect::new(move |env: Env| {
        let from = from.clone();
        let to = to.clone();
        async move {
            loop {
                let item = match from.receive().eval(env.clone()).await {
                    Exit::Success(item) => item,
                    Exit::Failure(cause) => {
                        if cause.first_failure().is_some() {
                            return Exit::Success(());
                        }
                        return Exit::Failure(cause.cast_failures_absent());
                    }
                };
                match to.send(item).eval(env.clone()).await {
                    Exit::Success(()) => {}
                    Exit::Failure(cause) => {
                        if cause.first_failure().is_some() {
                            return Exit::Success(());
                        }
                        return Exit::Failure(cause.cast_failures_absent());
                    }
                }
            }
        }
        .boxed_local()
    })
}

/// Waits for the first of many fiber results, handing back the rest.
struct WaitAny<E> {
    entries: Option<Vec<(usize, DeferredWait<Exit<(), E>>)>>,
}

impl<E: Clone + 'static> Future for WaitAny<E> {
    type Output = (usize, Exit<(), E>, Vec<(usize, DeferredWait<Exit<(), E>>)>);

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let entries = this.entries.as_mut().expect("wait polled after completion");
        let mut ready = None;
        for (position, (_, wait)) in entries.iter_mut().enumerate() {
            if let Poll::Ready(exit) = Pin::new(wait).poll(cx) {
                ready = Some((position, exit));
                break;
            }
        }
        match ready {
            Some((position, exit)) => {
                let mut entries = this.entries.take().expect("wait polled after completion");
                let (stage, _) = entries.remove(position);
                Poll::Ready((stage, exit, entries))
            }
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::sync::cell::Ref;
    use pretty_assertions::assert_eq;

    #[test]
    fn two_stage_pipeline_transforms_in_order() {
        let rt = Runtime::with_test_clock();
        let input = Channel::<i32>::bounded(4);
        let output = Channel::<i32>::bounded(4);
        let pipeline = Pipeline::<i32, i32, String>::new()
            .stage(|x| Effect::succeed(x * 2), 1, 2)
            .stage(|x| Effect::succeed(x + 1), 1, 2);

        let feed = {
            let input = input.clone();
            (1..=3).fold(Effect::<(), String>::unit(), move |acc, x| {
                acc.then(input.send(x).map_error(|e| format!("feed: {e}")))
            })
        };
        let drain = {
            let output = output.clone();
            let seen = Ref::new(Vec::<i32>::new());
            let results = seen.clone();
            (0..3)
                .fold(Effect::<(), String>::unit(), move |acc, _| {
                    let output = output.clone();
                    let seen = seen.clone();
                    acc.then(
                        output
                            .receive()
                            .map_error(|e| format!("drain: {e}"))
                            .flat_map(move |x| seen.update(move |mut v| {
                                v.push(x);
                                v
                            })
                            .map(|_| ())),
                    )
                })
                .map(move |()| results.get_now())
        };

        let run = pipeline.run(input.clone(), output.clone());
        let program = run
            .fork()
            .flat_map(move |pipeline_fiber| {
                let input = input.clone();
                feed.clone()
                    .then(input.close())
                    .then(drain.clone())
                    .flat_map(move |results| {
                        pipeline_fiber.join().map(move |()| results.clone())
                    })
            });
        assert_eq!(rt.run(program), Exit::Success(vec![3, 5, 7]));
    }

    #[test]
    fn stage_failure_interrupts_the_pipeline() {
        let rt = Runtime::with_test_clock();
        let input = Channel::<i32>::bounded(4);
        let output = Channel::<i32>::bounded(4);
        let pipeline = Pipeline::<i32, i32, String>::new().stage(
            |x| {
                if x == 2 {
                    Effect::fail("bad item".to_owned())
                } else {
                    Effect::succeed(x)
                }
            },
            2,
            2,
        );
        let feed = {
            let input = input.clone();
            (1..=3).fold(Effect::<(), String>::unit(), move |acc, x| {
                acc.then(input.send(x).map_error(|e| format!("feed: {e}")))
            })
        };
        let program = feed.then(pipeline.run(input.clone(), output));
        let exit = rt.run(program);
        match exit {
            Exit::Failure(cause) => assert_eq!(cause.failures(), vec![&"bad item".to_owned()]),
            other => panic!("expected pipeline failure, got {other:?}"),
        }
    }
}
