//! The `Clock` service: monotonic time and sleeping.
//!
//! The core calls exactly two operations, [`Clock::now`] and
//! [`Clock::sleep`], so a test implementation can substitute virtual time.
//! Both built-in clocks are views over the runtime's timer driver: the live
//! clock parks the thread between deadlines, the [`TestClock`] jumps to
//! them.

use std::convert::Infallible;
use std::rc::Rc;
use std::time::Duration;

use crate::cause::Cause;
use crate::effect::{Effect, Env};
use crate::exit::Exit;
use crate::fiber::interruptible;
use crate::runtime::TimerDriver;

/// Time as seen by computations: a monotonic duration since the runtime was
/// created, and a suspending sleep.
pub trait Clock {
    fn now(&self) -> Duration;
    fn sleep(&self, d: Duration) -> Effect<(), Infallible>;
}

/// The `Clock` service handle stored in the context.
#[derive(Clone)]
pub struct ClockService(pub Rc<dyn Clock>);

fn sleep_effect(driver: Rc<TimerDriver>, d: Duration) -> Effect<(), Infallible> {
    Effect::from_async(move |env: Env| {
        let driver = driver.clone();
        async move {
            match interruptible(&env.fiber, driver.sleep(d)).await {
                Ok(()) => Exit::Success(()),
                Err(by) => Exit::Failure(Cause::Interrupt(by)),
            }
        }
    })
}

/// The live clock: wall-parking monotonic time.
pub(crate) struct RuntimeClock {
    driver: Rc<TimerDriver>,
}

impl RuntimeClock {
    pub(crate) fn new(driver: Rc<TimerDriver>) -> Self {
        Self { driver }
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> Duration {
        self.driver.now()
    }

    fn sleep(&self, d: Duration) -> Effect<(), Infallible> {
        sleep_effect(self.driver.clone(), d)
    }
}

/// A virtual clock for tests. Time starts at zero and moves only by
/// [`TestClock::advance`] or by the executor auto-advancing to the next
/// deadline when every fiber is suspended.
#[derive(Clone)]
pub struct TestClock {
    driver: Rc<TimerDriver>,
}

impl TestClock {
    pub(crate) fn new(driver: Rc<TimerDriver>) -> Self {
        Self { driver }
    }

    pub fn now(&self) -> Duration {
        self.driver.now()
    }

    /// Moves virtual time forward, waking every sleeper whose deadline was
    /// reached.
    pub fn advance(&self, d: Duration) {
        self.driver.advance_by(d);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        self.driver.now()
    }

    fn sleep(&self, d: Duration) -> Effect<(), Infallible> {
        sleep_effect(self.driver.clone(), d)
    }
}
