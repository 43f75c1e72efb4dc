//! The `Tracer` service: spans with events. Exporting is out of scope; the
//! built-in tracers either drop spans or narrate them through the `log`
//! facade.

use std::rc::Rc;

pub trait SpanHandle {
    fn add_event(&self, name: &str, attrs: &[(&str, String)]);
    fn end(&self);
}

pub struct Span(pub Rc<dyn SpanHandle>);

impl Span {
    #[inline]
    pub fn add_event(&self, name: &str, attrs: &[(&str, String)]) {
        self.0.add_event(name, attrs)
    }

    #[inline]
    pub fn end(&self) {
        self.0.end()
    }
}

pub trait Tracer {
    fn start_span(&self, name: &str, attrs: &[(&str, String)]) -> Span;
}

/// The `Tracer` service handle stored in the context.
#[derive(Clone)]
pub struct TracerService(pub Rc<dyn Tracer>);

/// Discards all spans.
pub struct NoopTracer;

struct NoopSpan;

impl SpanHandle for NoopSpan {
    fn add_event(&self, _name: &str, _attrs: &[(&str, String)]) {}
    fn end(&self) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _attrs: &[(&str, String)]) -> Span {
        Span(Rc::new(NoopSpan))
    }
}

/// Narrates spans at debug level.
pub struct LogTracer;

struct LogSpan {
    name: String,
}

impl SpanHandle for LogSpan {
    fn add_event(&self, name: &str, attrs: &[(&str, String)]) {
        log::debug!("span {} event {name} {attrs:?}", self.name);
    }

    fn end(&self) {
        log::debug!("span {} end", self.name);
    }
}

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, attrs: &[(&str, String)]) -> Span {
        log::debug!("span {name} start {attrs:?}");
        Span(Rc::new(LogSpan {
            name: name.to_owned(),
        }))
    }
}
