//! Drivers feeding bars to a strategy
//!
//! [`LiveRunner`] polls the exchange and records a [`Tape`](crate::tape::Tape);
//! [`ReplayRunner`] plays a tape back against the simulated gateway. Both
//! hand bars to the strategy in the same order, so a replay of a live tape
//! takes the same decisions.

mod live;
mod replay;

pub use live::{LiveRunner, LiveRunnerInput, Poll};
pub use replay::{ReplayReport, ReplayRequest, ReplayRunner};
