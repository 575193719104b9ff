pub mod prelude;
pub mod reactor;
pub mod sched;
pub mod telemetry;
pub mod throttle;

pub use reactor::{Cond, Reactor, WatchToken};
pub use sched::{Priority, Scheduler, TaskHandle};
pub use throttle::{Decision, Throttle};
