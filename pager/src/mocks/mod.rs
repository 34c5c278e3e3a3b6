//! Mock implementations of the collaborators of a virtualized collection.
//!
//! - [Provider]: an in-memory dataset of [Customer]s with a fetch log, an adjustable count,
//!   injectable failures and an optional fetch delay.
//! - [Queue]: [crate::Workers] that hold jobs until explicitly run, in any order.
//! - [Clock]: a [crate::Clock] that only moves when told to.

mod clock;
pub use clock::Clock;
mod provider;
pub use provider::{Customer, Failure, Predicate, Provider};
mod queue;
pub use queue::Queue;
