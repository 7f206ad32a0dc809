//! Mechanical execution of trading plans on a single pair.
//!
//! A [`strategy`] consumes bars and drives an [`controller::OrderController`],
//! which owns the one outstanding order of the plan and talks to an exchange
//! through the [`market::Gateway`] trait. The same strategy code runs live
//! ([`market::RestGateway`]), on paper, or in replay against a recorded
//! [`tape::Tape`] ([`market::SimulatedGateway`]).

pub mod bars;
pub mod config;
pub mod consts;
pub mod controller;
mod errors;
pub mod helpers;
pub mod indicators;
pub mod market;
pub mod runner;
pub mod strategy;
pub mod tape;

pub use errors::{Error, Result};
