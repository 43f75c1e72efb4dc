//! The `MetricsRegistry` service. The core touches it only from the
//! [`instrument`](crate::Effect::instrument) wrapper; exporters are the host
//! application's business. The in-memory registry keeps everything
//! inspectable for tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

pub trait CounterHandle {
    fn inc(&self, v: f64);
}

pub trait GaugeHandle {
    fn set(&self, v: f64);
}

pub trait HistogramHandle {
    fn observe(&self, v: f64);
}

pub struct Counter(pub Rc<dyn CounterHandle>);

impl Counter {
    #[inline]
    pub fn inc(&self, v: f64) {
        self.0.inc(v)
    }
}

pub struct Gauge(pub Rc<dyn GaugeHandle>);

impl Gauge {
    #[inline]
    pub fn set(&self, v: f64) {
        self.0.set(v)
    }
}

pub struct Histogram(pub Rc<dyn HistogramHandle>);

impl Histogram {
    #[inline]
    pub fn observe(&self, v: f64) {
        self.0.observe(v)
    }
}

pub trait MetricsRegistry {
    fn counter(&self, name: &str, labels: &[(&str, String)]) -> Counter;
    fn gauge(&self, name: &str, labels: &[(&str, String)]) -> Gauge;
    fn histogram(&self, name: &str, labels: &[(&str, String)]) -> Histogram;
}

/// The `MetricsRegistry` service handle stored in the context.
#[derive(Clone)]
pub struct MetricsService(pub Rc<dyn MetricsRegistry>);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, String)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

/// Registry that accumulates values in process memory.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: RefCell<HashMap<MetricKey, Rc<Cell<f64>>>>,
    gauges: RefCell<HashMap<MetricKey, Rc<Cell<f64>>>>,
    histograms: RefCell<HashMap<MetricKey, Rc<RefCell<Vec<f64>>>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, String)]) -> Option<f64> {
        self.counters
            .borrow()
            .get(&MetricKey::new(name, labels))
            .map(|cell| cell.get())
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, String)]) -> Option<f64> {
        self.gauges
            .borrow()
            .get(&MetricKey::new(name, labels))
            .map(|cell| cell.get())
    }

    pub fn histogram_values(&self, name: &str, labels: &[(&str, String)]) -> Option<Vec<f64>> {
        self.histograms
            .borrow()
            .get(&MetricKey::new(name, labels))
            .map(|values| values.borrow().clone())
    }
}

struct CellCounter(Rc<Cell<f64>>);

impl CounterHandle for CellCounter {
    fn inc(&self, v: f64) {
        self.0.set(self.0.get() + v);
    }
}

struct CellGauge(Rc<Cell<f64>>);

impl GaugeHandle for CellGauge {
    fn set(&self, v: f64) {
        self.0.set(v);
    }
}

struct VecHistogram(Rc<RefCell<Vec<f64>>>);

impl HistogramHandle for VecHistogram {
    fn observe(&self, v: f64) {
        self.0.borrow_mut().push(v);
    }
}

impl MetricsRegistry for InMemoryMetrics {
    fn counter(&self, name: &str, labels: &[(&str, String)]) -> Counter {
        let cell = self
            .counters
            .borrow_mut()
            .entry(MetricKey::new(name, labels))
            .or_default()
            .clone();
        Counter(Rc::new(CellCounter(cell)))
    }

    fn gauge(&self, name: &str, labels: &[(&str, String)]) -> Gauge {
        let cell = self
            .gauges
            .borrow_mut()
            .entry(MetricKey::new(name, labels))
            .or_default()
            .clone();
        Gauge(Rc::new(CellGauge(cell)))
    }

    fn histogram(&self, name: &str, labels: &[(&str, String)]) -> Histogram {
        let values = self
            .histograms
            .borrow_mut()
            .entry(MetricKey::new(name, labels))
            .or_default()
            .clone();
        Histogram(Rc::new(VecHistogram(values)))
    }
}
