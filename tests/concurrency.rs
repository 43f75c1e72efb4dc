//! Concurrent semantics: parallel combinators, cancellation, channels,
//! supervision. Everything runs on the virtual clock, so timing assertions
//! are exact and the tests complete instantly.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use strand::runtime::{FiberOutcome, Supervisor};
use strand::service::metrics::{InMemoryMetrics, MetricsService};
use strand::{
    for_each_par, merge_all, race, race_first, zip_par, Effect, Exit, FiberId, FiberStatus, Hub,
    Ref, Runtime,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn zip_par_cancels_the_slow_branch_on_failure() {
    let rt = Runtime::with_test_clock();
    let clock = rt.test_clock().unwrap();
    let cancelled = Ref::new(false);
    let marker = cancelled.clone();

    let slow: Effect<i32, String> = Effect::<(), String>::sleep(ms(50))
        .then(Effect::succeed(1))
        .on_interrupt(marker.set(true));
    let fast: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(10)).then(Effect::fail("x".to_owned()));

    let exit = rt.run(zip_par(slow, fast));
    match exit {
        Exit::Failure(cause) => assert_eq!(cause.failures(), vec![&"x".to_owned()]),
        other => panic!("expected the fast failure, got {other:?}"),
    }
    assert!(cancelled.get_now());
    // The slow branch was signalled at the failure instant, not after its
    // own sleep.
    assert_eq!(clock.now(), ms(10));
}

#[test]
fn zip_par_pairs_joint_successes() {
    let rt = Runtime::with_test_clock();
    let left: Effect<i32, String> = Effect::<(), String>::sleep(ms(5)).then(Effect::succeed(1));
    let right: Effect<&'static str, String> =
        Effect::<(), String>::sleep(ms(3)).then(Effect::succeed("b"));
    assert_eq!(rt.run(zip_par(left, right)), Exit::Success((1, "b")));
}

#[test]
fn race_returns_the_first_success_and_interrupts_the_loser() {
    let rt = Runtime::with_test_clock();
    let clock = rt.test_clock().unwrap();
    let loser_interrupted = Ref::new(false);
    let marker = loser_interrupted.clone();

    let fast: Effect<&'static str, String> =
        Effect::<(), String>::sleep(ms(10)).then(Effect::succeed("x"));
    let slow: Effect<&'static str, String> = Effect::<(), String>::sleep(ms(20))
        .then(Effect::succeed("y"))
        .on_interrupt(marker.set(true));

    assert_eq!(rt.run(race(fast, slow)), Exit::Success("x"));
    assert!(loser_interrupted.get_now());
    assert_eq!(clock.now(), ms(10));
}

#[test]
fn race_waits_out_an_early_failure() {
    let rt = Runtime::with_test_clock();
    let fast_fail: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(5)).then(Effect::fail("early".to_owned()));
    let slow_ok: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(15)).then(Effect::succeed(7));
    assert_eq!(rt.run(race(fast_fail, slow_ok)), Exit::Success(7));
}

#[test]
fn race_combines_two_failures_concurrently() {
    let rt = Runtime::with_test_clock();
    let a: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(5)).then(Effect::fail("a".to_owned()));
    let b: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(10)).then(Effect::fail("b".to_owned()));
    match rt.run(race(a, b)) {
        Exit::Failure(cause) => {
            assert!(matches!(cause, strand::Cause::Both(_, _)));
            assert_eq!(cause.failures().len(), 2);
        }
        other => panic!("expected combined failure, got {other:?}"),
    }
}

#[test]
fn race_first_takes_the_first_completion_even_a_failure() {
    let rt = Runtime::with_test_clock();
    let quick_fail: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(2)).then(Effect::fail("first".to_owned()));
    let slow_ok: Effect<i32, String> =
        Effect::<(), String>::sleep(ms(50)).then(Effect::succeed(1));
    assert_eq!(
        rt.run(race_first(vec![quick_fail, slow_ok])),
        Exit::fail("first".to_owned())
    );
}

#[test]
fn empty_race_is_a_defect() {
    let rt = Runtime::with_test_clock();
    match rt.run(race_first(Vec::<Effect<i32, String>>::new())) {
        Exit::Failure(cause) => assert!(cause.is_die()),
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn for_each_par_preserves_input_order_and_bounds_concurrency() {
    let rt = Runtime::with_test_clock();
    let active = Ref::new(0i32);
    let peak = Ref::new(0i32);

    let runner_active = active.clone();
    let runner_peak = peak.clone();
    let program = for_each_par(
        vec![1, 2, 3, 4, 5],
        move |x: i32| {
            let active = runner_active.clone();
            let peak = runner_peak.clone();
            active
                .update::<String>(|n| n + 1)
                .flat_map(move |n| peak.update(move |p| p.max(n)))
                .then(Effect::sleep(ms(10)))
                .then(active.update(|n| n - 1))
                .map(move |_| x * 2)
        },
        2,
    );
    assert_eq!(rt.run(program), Exit::Success(vec![2, 4, 6, 8, 10]));
    assert!(peak.get_now() <= 2);
}

#[test]
fn merge_all_cancels_pending_work_on_failure() {
    let rt = Runtime::with_test_clock();
    let clock = rt.test_clock().unwrap();
    let completed = Ref::new(0i32);

    let effects: Vec<Effect<i32, String>> = vec![
        Effect::<(), String>::sleep(ms(5)).then(Effect::fail("die early".to_owned())),
        {
            let completed = completed.clone();
            Effect::<(), String>::sleep(ms(50))
                .then(completed.update(|n| n + 1))
        },
        {
            let completed = completed.clone();
            Effect::<(), String>::sleep(ms(60))
                .then(completed.update(|n| n + 1))
        },
    ];
    assert!(rt.run(merge_all(effects, 3)).is_failure());
    assert_eq!(completed.get_now(), 0);
    assert_eq!(clock.now(), ms(5));
}

#[test]
fn merge_all_with_zero_parallelism_is_a_defect() {
    let rt = Runtime::with_test_clock();
    let effects: Vec<Effect<i32, String>> = vec![Effect::succeed(1)];
    match rt.run(merge_all(effects, 0)) {
        Exit::Failure(cause) => assert!(cause.is_die()),
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn timeout_interrupts_the_primary_and_runs_its_finalizers() {
    let rt = Runtime::with_test_clock();
    let clock = rt.test_clock().unwrap();
    let finalized = Ref::new(false);
    let marker = finalized.clone();

    let primary: Effect<i32, String> = Effect::<(), String>::sleep(ms(100))
        .then(Effect::succeed(1))
        .ensuring(marker.set(true));
    assert_eq!(rt.run(primary.timeout(ms(10))), Exit::Success(None));
    assert!(finalized.get_now());
    assert_eq!(clock.now(), ms(10));
}

#[test]
fn timeout_passes_through_a_fast_success() {
    let rt = Runtime::with_test_clock();
    let primary: Effect<i32, String> = Effect::succeed(5);
    assert_eq!(rt.run(primary.timeout(ms(10))), Exit::Success(Some(5)));
}

#[test]
fn interrupting_a_fiber_runs_its_finalizers() {
    let rt = Runtime::with_test_clock();
    let finalized = Ref::new(false);
    let marker = finalized.clone();

    let program = Effect::<(), String>::never()
        .ensuring(marker.set(true))
        .fork()
        .flat_map(|fiber| {
            Effect::<(), String>::sleep(ms(5))
                .then(fiber.interrupt())
                .map(move |exit| (exit.is_interrupted(), fiber.status()))
        });
    assert_eq!(
        rt.run(program),
        Exit::Success((true, FiberStatus::Interrupted))
    );
    assert!(finalized.get_now());
}

#[test]
fn uninterruptible_defers_the_signal_to_region_exit() {
    let rt = Runtime::with_test_clock();
    let clock = rt.test_clock().unwrap();
    let inside_done = Ref::new(false);
    let after_ran = Ref::new(false);
    let inside = inside_done.clone();
    let after = after_ran.clone();

    let body = Effect::<(), String>::sleep(ms(50))
        .then(inside.set(true))
        .uninterruptible()
        .then(after.set(true));
    let program = body.fork().flat_map(|fiber| {
        Effect::<(), String>::sleep(ms(5))
            .then(fiber.interrupt())
            .map(|exit| exit.is_interrupted())
    });
    assert_eq!(rt.run(program), Exit::Success(true));
    // The masked region completed despite the interrupt arriving at 5ms...
    assert!(inside_done.get_now());
    // ...and the signal was observed at region exit, skipping the rest.
    assert!(!after_ran.get_now());
    assert_eq!(clock.now(), ms(50));
}

#[test]
fn restore_reinstates_interruptibility_inside_a_mask() {
    let rt = Runtime::with_test_clock();
    let clock = rt.test_clock().unwrap();
    let tail_ran = Ref::new(false);
    let tail = tail_ran.clone();

    let body = Effect::<(), String>::uninterruptible_mask(move |outer| {
        let tail = tail.clone();
        outer
            .restore(Effect::<(), String>::sleep(ms(50)))
            .then(tail.set(true))
    });
    let program = body.fork().flat_map(|fiber| {
        Effect::<(), String>::sleep(ms(5))
            .then(fiber.interrupt())
            .map(|exit| exit.is_interrupted())
    });
    assert_eq!(rt.run(program), Exit::Success(true));
    assert!(!tail_ran.get_now());
    // The restored sleep observed the interrupt promptly.
    assert_eq!(clock.now(), ms(5));
}

#[test]
fn channel_delivers_in_fifo_order_within_capacity() {
    let rt = Runtime::with_test_clock();
    let chan = strand::channel::Channel::<i32>::bounded(2);
    let seen = Ref::new(Vec::<i32>::new());
    let overflow = Ref::new(false);

    let sender = {
        let chan = chan.clone();
        (1..=4).fold(Effect::<(), String>::unit(), move |acc, x| {
            acc.then(chan.send(x).map_error(|e| format!("send: {e}")))
        })
    };
    let receiver = {
        let chan = chan.clone();
        let seen = seen.clone();
        let overflow = overflow.clone();
        (0..4).fold(Effect::<(), String>::unit(), move |acc, _| {
            let chan = chan.clone();
            let seen = seen.clone();
            let overflow = overflow.clone();
            acc.then(
                chan.receive()
                    .map_error(|e| format!("recv: {e}"))
                    .flat_map(move |x| {
                        let fits = chan.len() <= 2;
                        overflow
                            .update(move |was| was || !fits)
                            .then(seen.update(move |mut v| {
                                v.push(x);
                                v
                            }))
                            .map(|_| ())
                    }),
            )
        })
    };

    let program = sender
        .fork()
        .flat_map(move |sender_fiber| receiver.clone().then(sender_fiber.join()));
    assert_eq!(rt.run(program), Exit::Success(()));
    assert_eq!(seen.get_now(), vec![1, 2, 3, 4]);
    assert!(!overflow.get_now());
}

#[test]
fn hub_broadcasts_to_every_subscriber() {
    let rt = Runtime::with_test_clock();
    let hub = Hub::<i32>::new(4);

    let publisher = hub.clone();
    let program = hub.subscribe::<String>().flat_map(move |first| {
        let first = Rc::new(first);
        let publisher = publisher.clone();
        publisher.subscribe().flat_map(move |second| {
            let second = Rc::new(second);
            let recv = |sub: &strand::sync::hub::Subscription<i32>| {
                sub.receive().map_error(|e| format!("recv: {e}"))
            };
            let keep = (first.clone(), second.clone());
            publisher
                .publish(1)
                .then(publisher.publish(2))
                .then(recv(&first))
                .zip(recv(&first))
                .zip(recv(&second))
                .zip(recv(&second))
                .map(move |(((a, b), c), d)| {
                    // keep the subscriptions alive while the receives run
                    let _ = &keep;
                    (a, b, c, d)
                })
        })
    });
    assert_eq!(rt.run(program), Exit::Success((1, 2, 1, 2)));
}

#[test]
fn supervisor_hooks_observe_fiber_lifecycles() {
    #[derive(Default)]
    struct Recording {
        events: RefCell<Vec<String>>,
    }

    impl Supervisor for Recording {
        fn on_start(&self, fiber: FiberId) {
            self.events.borrow_mut().push(format!("start {fiber}"));
        }

        fn on_end(&self, fiber: FiberId, outcome: &FiberOutcome) {
            self.events
                .borrow_mut()
                .push(format!("end {fiber} {outcome:?}"));
        }

        fn on_failure(&self, _fiber: FiberId, rendered_cause: &str) {
            self.events
                .borrow_mut()
                .push(format!("failure: {}", rendered_cause.lines().next().unwrap()));
        }
    }

    let recorder = Rc::new(Recording::default());
    let rt = Runtime::with_test_clock().with_supervisor(recorder.clone());

    let program = Effect::<i32, String>::fail("boom".to_owned())
        .fork()
        .flat_map(|fiber| fiber.wait::<String>())
        .map(|_| ());
    assert_eq!(rt.run(program), Exit::Success(()));

    let events = recorder.events.borrow();
    assert!(events.iter().any(|e| e.starts_with("start ")));
    assert!(events.iter().any(|e| e.contains("Failed")));
    assert!(events.iter().any(|e| e.starts_with("failure: ")));
}

#[test]
fn instrument_counts_outcomes_in_the_registry() {
    let registry = Rc::new(InMemoryMetrics::new());
    let rt = Runtime::with_test_clock().with_service(MetricsService(registry.clone()));

    let ok: Effect<i32, String> = Effect::succeed(1).instrument("job");
    assert_eq!(rt.run(ok), Exit::Success(1));
    let bad: Effect<i32, String> = Effect::fail("x".to_owned()).instrument("job");
    assert!(rt.run(bad).is_failure());

    assert_eq!(
        registry.counter_value("job_total", &[("outcome", "success".to_owned())]),
        Some(1.0)
    );
    assert_eq!(
        registry.counter_value("job_total", &[("outcome", "failure".to_owned())]),
        Some(1.0)
    );
    assert_eq!(
        registry
            .histogram_values("job_duration_seconds", &[])
            .map(|v| v.len()),
        Some(2)
    );
}

#[test]
fn stalled_fleet_exits_with_a_deadlock_defect() {
    let rt = Runtime::with_test_clock();
    match rt.run(Effect::<(), String>::never()) {
        Exit::Failure(cause) => {
            assert!(cause.is_die());
            assert!(cause.pretty_render().contains("deadlock"));
        }
        other => panic!("expected a deadlock defect, got {other:?}"),
    }
}

#[test]
fn scope_close_interrupts_forked_children() {
    let rt = Runtime::with_test_clock();
    let finalized = Ref::new(false);
    let marker = finalized.clone();

    // The child outlives the program body; the root scope interrupts it on
    // close, and its finalizer completes before `run` returns.
    let program = Effect::<(), String>::never()
        .ensuring(marker.set(true))
        .fork()
        .then(Effect::succeed("done"));
    assert_eq!(rt.run(program), Exit::Success("done"));
    assert!(finalized.get_now());
}
