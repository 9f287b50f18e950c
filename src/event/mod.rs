//! Event bus - typed pub/sub with bounded fan-out
//!
//! - [`EventKind`]: the closed set of event types (wire names like
//!   `dag.task.started`)
//! - [`Event`]: envelope with monotonic id, relative timestamp, and source
//! - [`EventBus`]: wildcard-capable pub/sub with bounded per-subscription
//!   queues and drop-oldest backpressure

mod bus;
mod types;

pub use bus::{BusStats, EventBus, EventFilter, Subscription};
pub use types::{Event, EventKind};
