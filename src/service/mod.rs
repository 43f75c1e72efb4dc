//! Injected services: clock, random, logger, metrics and tracer. Each is an
//! ordinary value in the [`Context`](crate::Context), attached either by the
//! runtime defaults or through layers.

pub mod clock;
pub mod logger;
pub mod metrics;
pub mod random;
pub mod tracer;

use futures::FutureExt;

use std::rc::Rc;

use crate::effect::Effect;
use clock::ClockService;
use metrics::MetricsService;
use tracer::TracerService;

impl<A: 'static, E: 'static> Effect<A, E> {
    /// Wraps the computation in a span and outcome metrics: a
    /// `{name}_total` counter labelled by outcome and a
    /// `{name}_duration_seconds` histogram. This wrapper is the only place
    /// the library itself touches the metrics registry.
    pub fn instrument(self, name: impl Into<String>) -> Effect<A, E> {
        let name: Rc<str> = Rc::from(name.into());
        Effect::new(move |env| {
            let this = self.clone();
            let name = name.clone();
            async move {
                let tracer = env.ctx.get::<TracerService>();
                let metrics = env.ctx.get::<MetricsService>();
                let clock = env.ctx.get::<ClockService>();
                let span = tracer.map(|t| t.0.start_span(&name, &[]));
                let started = clock.as_ref().map(|c| c.0.now());

                let exit = this.eval(env.clone()).await;

                let outcome = if exit.is_success() {
                    "success"
                } else if exit.is_interrupted() {
                    "interrupted"
                } else {
                    "failure"
                };
                if let Some(metrics) = &metrics {
                    metrics
                        .0
                        .counter(
                            &format!("{name}_total"),
                            &[("outcome", outcome.to_owned())],
                        )
                        .inc(1.0);
                    if let (Some(clock), Some(started)) = (&clock, started) {
                        let elapsed = clock.0.now().saturating_sub(started);
                        metrics
                            .0
                            .histogram(&format!("{name}_duration_seconds"), &[])
                            .observe(elapsed.as_secs_f64());
                    }
                }
                if let Some(span) = span {
                    if !exit.is_success() {
                        span.add_event("failed", &[("outcome", outcome.to_owned())]);
                    }
                    span.end();
                }
                exit
            }
            .boxed_local()
        })
    }
}
