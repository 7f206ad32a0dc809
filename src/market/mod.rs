//! Exchange Gateway Module
//!
//! One [`Gateway`] trait with three implementations:
//!
//! - [`RestGateway`]: the live exchange over HTTPS
//! - [`SimulatedGateway`]: deterministic matching for replays and paper trading
//! - [`mock::MockGateway`]: scriptable double for tests
//!
//! Strategies never hold a concrete gateway; the driver builds one and hands
//! it over as `Arc<dyn Gateway>`.

mod gateway;
mod rest;
mod simulated;
mod types;

pub use gateway::{mock, Gateway};
pub use rest::RestGateway;
pub use simulated::{SimulatedGateway, SimulatedGatewayInput};
pub use types::{Order, OrderIntent, OrderKind, OrderSide, OrderStatus, Position};
