//! The `Random` service, used by jittered schedules.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub trait Random {
    /// A uniform double in `[0.0, 1.0)`.
    fn next_double(&self) -> f64;
    fn next_long(&self) -> u64;
}

/// The `Random` service handle stored in the context.
#[derive(Clone)]
pub struct RandomService(pub Rc<dyn Random>);

/// OS-seeded random source.
pub struct LiveRandom {
    rng: RefCell<StdRng>,
}

impl LiveRandom {
    pub fn new() -> Self {
        Self {
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for LiveRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl Random for LiveRandom {
    fn next_double(&self) -> f64 {
        self.rng.borrow_mut().gen::<f64>()
    }

    fn next_long(&self) -> u64 {
        self.rng.borrow_mut().gen::<u64>()
    }
}

/// Replays a scripted sequence; falls back to a fixed midpoint when the
/// script runs out. Deterministic by construction.
pub struct TestRandom {
    doubles: RefCell<VecDeque<f64>>,
    longs: RefCell<VecDeque<u64>>,
}

impl TestRandom {
    pub fn new(doubles: impl IntoIterator<Item = f64>, longs: impl IntoIterator<Item = u64>) -> Self {
        Self {
            doubles: RefCell::new(doubles.into_iter().collect()),
            longs: RefCell::new(longs.into_iter().collect()),
        }
    }
}

impl Random for TestRandom {
    fn next_double(&self) -> f64 {
        self.doubles.borrow_mut().pop_front().unwrap_or(0.5)
    }

    fn next_long(&self) -> u64 {
        self.longs.borrow_mut().pop_front().unwrap_or(0)
    }
}
