//! Sequential semantics: composition laws, recovery, scopes, services.

use std::convert::Infallible;

use pretty_assertions::assert_eq;

use strand::service::logger::Level;
use strand::{Cause, Deferred, Effect, Exit, FiberLocal, Layer, Ref, Runtime, Scope};

#[test]
fn map_and_flat_map_compose() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<i32, String>::succeed(10)
        .map(|x| x * 2)
        .flat_map(|x| Effect::succeed(x + 3));
    assert_eq!(rt.run(program), Exit::Success(23));
}

#[test]
fn monad_left_identity() {
    let rt = Runtime::with_test_clock();
    let f = |x: i32| Effect::<i32, String>::succeed(x + 1);
    let lhs = rt.run(Effect::<i32, String>::succeed(5).flat_map(f));
    let rhs = rt.run(f(5));
    assert_eq!(lhs, rhs);
}

#[test]
fn monad_right_identity() {
    let rt = Runtime::with_test_clock();
    let m = || Effect::<i32, String>::succeed(9);
    let lhs = rt.run(m().flat_map(Effect::succeed));
    let rhs = rt.run(m());
    assert_eq!(lhs, rhs);
}

#[test]
fn monad_associativity() {
    let rt = Runtime::with_test_clock();
    let m = || Effect::<i32, String>::succeed(2);
    let f = |x: i32| Effect::<i32, String>::succeed(x * 10);
    let g = |x: i32| Effect::<i32, String>::succeed(x + 1);
    let lhs = rt.run(m().flat_map(f).flat_map(g));
    let rhs = rt.run(m().flat_map(move |x| f(x).flat_map(g)));
    assert_eq!(lhs, rhs);
}

#[test]
fn failure_short_circuits() {
    let rt = Runtime::with_test_clock();
    let ran = Ref::new(false);
    let observer = ran.clone();
    let program = Effect::<i32, String>::fail("boom".to_owned())
        .flat_map(move |x| observer.set(true).map(move |()| x));
    assert_eq!(rt.run(program), Exit::fail("boom".to_owned()));
    assert!(!ran.get_now());
}

#[test]
fn catch_all_recovers_typed_failures() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<String, String>::fail("boom".to_owned())
        .catch_all(|err| Effect::<String, String>::succeed(format!("handled:{err}")));
    assert_eq!(rt.run(program), Exit::Success("handled:boom".to_owned()));
}

#[test]
fn catch_all_leaves_successes_alone() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<String, String>::succeed("fine".to_owned())
        .catch_all(|_| Effect::<String, String>::succeed("handled".to_owned()));
    assert_eq!(rt.run(program), Exit::Success("fine".to_owned()));
}

#[test]
fn catch_all_does_not_intercept_defects() {
    let rt = Runtime::with_test_clock();
    let program =
        Effect::<i32, String>::die("bug").catch_all(|_| Effect::<i32, String>::succeed(0));
    let exit = rt.run(program);
    match exit {
        Exit::Failure(cause) => assert!(cause.is_die()),
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn panics_in_thunks_become_defects() {
    let rt = Runtime::with_test_clock();
    let exit = rt.run(Effect::<i32, String>::sync(|| panic!("kaboom")));
    match exit {
        Exit::Failure(cause) => {
            assert!(cause.is_die());
            assert!(cause.pretty_render().contains("kaboom"));
        }
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn attempt_maps_panics_to_typed_failures() {
    let rt = Runtime::with_test_clock();
    let program = Effect::attempt(|| panic!("bad input"), |defect| defect.message().to_owned());
    assert_eq!(
        rt.run(program),
        Exit::<i32, String>::fail("bad input".to_owned())
    );
}

#[test]
fn fold_is_total_over_defects() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<i32, String>::die("bug")
        .fold::<&'static str, Infallible>(|cause| if cause.is_die() { "died" } else { "failed" }, |_| "ok");
    assert_eq!(rt.run(program), Exit::Success("died"));
}

#[test]
fn either_surfaces_typed_failures_as_values() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<i32, String>::fail("nope".to_owned()).either::<Infallible>();
    assert_eq!(rt.run(program), Exit::Success(Err("nope".to_owned())));
}

#[test]
fn sandbox_exposes_the_cause() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<i32, String>::die("bug").sandbox();
    match rt.run(program) {
        Exit::Failure(cause) => {
            let inner = cause.failures();
            assert_eq!(inner.len(), 1);
            assert!(inner[0].is_die());
        }
        other => panic!("expected sandboxed cause, got {other:?}"),
    }
}

#[test]
fn refine_or_die_narrows_the_error_channel() {
    let rt = Runtime::with_test_clock();
    let refine =
        |e: String| if e == "keep" { Some(e) } else { None };
    let kept = Effect::<i32, String>::fail("keep".to_owned()).refine_or_die(refine);
    assert_eq!(rt.run(kept), Exit::fail("keep".to_owned()));

    let dropped = Effect::<i32, String>::fail("drop".to_owned()).refine_or_die(refine);
    match rt.run(dropped) {
        Exit::Failure(cause) => assert!(cause.is_die()),
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn annotations_show_up_in_rendered_causes() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<(), String>::fail("boom".to_owned()).annotate("request 7");
    match rt.run(program) {
        Exit::Failure(cause) => {
            let rendered = cause.pretty_render();
            assert!(rendered.contains("note: request 7"));
            assert!(rendered.contains("boom"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn ensuring_runs_exactly_once_on_success_and_failure() {
    let rt = Runtime::with_test_clock();

    let runs = Ref::new(0);
    let marker = runs.clone();
    let ok = Effect::<i32, String>::succeed(1)
        .ensuring(marker.update::<Infallible>(|n| n + 1).map(|_| ()));
    assert_eq!(rt.run(ok), Exit::Success(1));
    assert_eq!(runs.get_now(), 1);

    let runs = Ref::new(0);
    let marker = runs.clone();
    let bad = Effect::<i32, String>::fail("x".to_owned())
        .ensuring(marker.update::<Infallible>(|n| n + 1).map(|_| ()));
    assert!(rt.run(bad).is_failure());
    assert_eq!(runs.get_now(), 1);
}

#[test]
fn finalizer_defects_attach_sequentially() {
    let rt = Runtime::with_test_clock();
    let program = Effect::<i32, String>::fail("primary".to_owned())
        .ensuring(Effect::sync(|| panic!("cleanup bug")));
    match rt.run(program) {
        Exit::Failure(Cause::Then(first, second)) => {
            assert!(first.is_fail());
            assert!(second.is_die());
        }
        other => panic!("expected sequential cause, got {other:?}"),
    }
}

#[test]
fn scope_releases_in_reverse_order() {
    let rt = Runtime::with_test_clock();
    let log = Ref::new(Vec::<String>::new());
    let scope = Scope::new();

    let push = |name: &'static str| {
        let log = log.clone();
        log.update::<Infallible>(move |mut v| {
            v.push(name.to_owned());
            v
        })
        .map(|_| ())
    };

    let program = scope
        .add_finalizer(push("A"))
        .then(scope.add_finalizer(push("B")))
        .then(scope.add_finalizer(push("C")))
        .then(scope.close());
    assert_eq!(rt.run(program), Exit::Success(()));
    assert_eq!(
        log.get_now(),
        vec!["C".to_owned(), "B".to_owned(), "A".to_owned()]
    );
}

#[test]
fn closed_scope_runs_new_finalizers_immediately() {
    let rt = Runtime::with_test_clock();
    let ran = Ref::new(false);
    let marker = ran.clone();
    let scope = Scope::new();
    let program = scope
        .close()
        .then(scope.add_finalizer(marker.set(true)));
    assert_eq!(rt.run(program), Exit::Success(()));
    assert!(ran.get_now());
}

#[test]
fn acquire_release_pairs_under_failure() {
    let rt = Runtime::with_test_clock();
    let log = Ref::new(Vec::<String>::new());
    let push = |name: &'static str| {
        let log = log.clone();
        log.update::<Infallible>(move |mut v| {
            v.push(name.to_owned());
            v
        })
        .map(|_| ())
    };

    let acquired = push("acquire").widen().map(|()| "resource");
    let release_log = log.clone();
    let program = Effect::<&'static str, String>::acquire_release(acquired, move |_| {
        let log = release_log.clone();
        log.update::<Infallible>(|mut v| {
            v.push("release".to_owned());
            v
        })
        .map(|_| ())
    })
    .then(Effect::<(), String>::fail("use failed".to_owned()));

    assert!(rt.run(program).is_failure());
    assert_eq!(log.get_now(), vec!["acquire".to_owned(), "release".to_owned()]);
}

#[test]
fn failed_acquire_registers_no_release() {
    let rt = Runtime::with_test_clock();
    let released = Ref::new(false);
    let marker = released.clone();
    let program = Effect::<i32, String>::acquire_release(
        Effect::fail("no resource".to_owned()),
        move |_| marker.set(true),
    );
    assert!(rt.run(program).is_failure());
    assert!(!released.get_now());
}

#[test]
fn retry_gives_up_after_schedule_halts() {
    let rt = Runtime::with_test_clock();
    let calls = Ref::new(0u64);
    let counter = calls.clone();
    let eff = counter
        .update::<String>(|n| n + 1)
        .flat_map(|n| {
            if n < 3 {
                Effect::fail(format!("attempt {n}"))
            } else {
                Effect::succeed(n)
            }
        });

    assert!(rt
        .run(eff.clone().retry(strand::Schedule::recurs(1)))
        .is_failure());
    assert_eq!(calls.get_now(), 2);

    let calls = Ref::new(0u64);
    let counter = calls.clone();
    let eff = counter
        .update::<String>(|n| n + 1)
        .flat_map(|n| {
            if n < 3 {
                Effect::fail(format!("attempt {n}"))
            } else {
                Effect::succeed(n)
            }
        });
    assert_eq!(rt.run(eff.retry(strand::Schedule::recurs(2))), Exit::Success(3));
    assert_eq!(calls.get_now(), 3);
}

#[test]
fn deferred_is_single_assignment() {
    let rt = Runtime::with_test_clock();
    let deferred = Deferred::<i32>::new();
    let program = deferred
        .complete::<String>(1)
        .then(deferred.complete(2));
    match rt.run(program) {
        Exit::Failure(cause) => assert!(cause.is_die()),
        other => panic!("expected defect on double completion, got {other:?}"),
    }
}

#[test]
fn deferred_wakes_waiter_with_the_value() {
    let rt = Runtime::with_test_clock();
    let deferred = Deferred::<i32>::new();
    let waiter = deferred.wait::<String>();
    let program = waiter
        .fork()
        .flat_map(move |fiber| deferred.complete(42).then(fiber.join()));
    assert_eq!(rt.run(program), Exit::Success(42));
}

#[test]
fn fiber_locals_snapshot_at_fork() {
    let rt = Runtime::with_test_clock();
    let local = FiberLocal::new(0);
    let child_view = local.clone();
    let parent_view = local.clone();
    let program = local
        .set::<String>(1)
        .then(
            child_view
                .set(2)
                .then(child_view.get())
                .fork()
                .flat_map(|fiber| fiber.join()),
        )
        .zip(parent_view.get());
    assert_eq!(rt.run(program), Exit::Success((2, 1)));
}

#[test]
fn missing_service_is_a_defect() {
    let rt = Runtime::with_test_clock();

    #[derive(Clone)]
    struct Missing;

    let exit = rt.run(Effect::<Missing, String>::service().map(|_| ()));
    match exit {
        Exit::Failure(cause) => assert!(cause.is_die()),
        other => panic!("expected defect, got {other:?}"),
    }
}

#[test]
fn layers_build_in_order_and_release_in_reverse() {
    let rt = Runtime::with_test_clock();
    let log = Ref::new(Vec::<String>::new());

    #[derive(Clone)]
    struct Db;
    #[derive(Clone)]
    struct CacheOverDb;

    let push = |log: &Ref<Vec<String>>, name: &'static str| {
        let log = log.clone();
        log.update::<Infallible>(move |mut v| {
            v.push(name.to_owned());
            v
        })
        .map(|_| ())
    };

    let db_log = log.clone();
    let db_layer: Layer<String> = Layer::scoped(
        move |_ctx| push(&db_log, "open db").widen().map(|()| Db),
        {
            let log = log.clone();
            move |_db| push(&log, "close db")
        },
    );

    let cache_log = log.clone();
    let cache_layer: Layer<String> = Layer::scoped(
        move |ctx| {
            if ctx.get::<Db>().is_none() {
                return Effect::fail("cache needs the db".to_owned());
            }
            push(&cache_log, "open cache").widen().map(|()| CacheOverDb)
        },
        {
            let log = log.clone();
            move |_cache| push(&log, "close cache")
        },
    );

    let program = Effect::<CacheOverDb, String>::service()
        .map(|_| "served")
        .provide(db_layer + cache_layer);
    assert_eq!(rt.run(program), Exit::Success("served"));
    assert_eq!(
        log.get_now(),
        vec![
            "open db".to_owned(),
            "open cache".to_owned(),
            "close cache".to_owned(),
            "close db".to_owned(),
        ]
    );
}

#[test]
fn parallel_layer_conflicts_are_right_biased() {
    let rt = Runtime::with_test_clock();

    #[derive(Clone, Debug, PartialEq)]
    struct Port(u16);

    let layer: Layer<String> = Layer::succeed(Port(1)) | Layer::succeed(Port(2));
    let program = Effect::<Port, String>::service().provide(layer);
    assert_eq!(rt.run(program), Exit::Success(Port(2)));
}

#[test]
fn failed_composite_build_releases_the_built_parts() {
    let rt = Runtime::with_test_clock();
    let log = Ref::new(Vec::<String>::new());

    #[derive(Clone)]
    struct Db;

    let open_log = log.clone();
    let close_log = log.clone();
    let db_layer: Layer<String> = Layer::scoped(
        move |_ctx| {
            let log = open_log.clone();
            log.update::<Infallible>(|mut v| {
                v.push("open db".to_owned());
                v
            })
            .widen()
            .map(|_| Db)
        },
        move |_db| {
            let log = close_log.clone();
            log.update::<Infallible>(|mut v| {
                v.push("close db".to_owned());
                v
            })
            .map(|_| ())
        },
    );
    let broken: Layer<String> =
        Layer::from_effect(|_ctx| Effect::<i32, String>::fail("boom".to_owned()));

    let program = Effect::<i32, String>::succeed(0).provide(db_layer + broken);
    assert!(rt.run(program).is_failure());
    assert_eq!(
        log.get_now(),
        vec!["open db".to_owned(), "close db".to_owned()]
    );
}

#[test]
fn structured_log_levels_render_lowercase() {
    assert_eq!(Level::Warn.to_string(), "warn");
    assert_eq!(Level::Trace.to_string(), "trace");
}
