//! Strategy Module
//!
//! Trading plans as bar-driven state machines. Every plan owns an
//! [`OrderController`](crate::controller::OrderController) and only reaches
//! the exchange through it, so the same plan runs against the live
//! exchange, paper trading or a replayed tape.
//!
//! # Plans
//!
//! | name         | entry                          | exit                              |
//! |--------------|--------------------------------|-----------------------------------|
//! | `auto_bb`    | low under the lower band       | band levels, virtual stop         |
//! | `auto_bbrsi` | low under the band, RSI < 30   | RSI > 70, volatility stop         |
//! | `targets`    | optional range buy             | one slice per target, moving stop |
//! | `trailing`   | optional range buy             | half at target, trailing stop     |
//! | `cut`        | none                           | stop or limit                     |
//! | `ripple`     | 09:00 close 5 % under midnight | limit back at the midnight open   |
//!
//! # Usage
//!
//! ```ignore
//! let registry = StrategyRegistry::with_defaults();
//! let mut strategy = registry
//!     .create_strategy("cut", gateway, &args, false, &StrategyOptions::default())
//!     .await?;
//! while strategy.on_bar(&bar).await? {
//!     // next bar
//! }
//! ```

mod band;
mod bracket;
mod journal;
mod ledger;
mod plan;
mod registry;
mod ripple;
mod stops;
mod targets;
mod trailing;
mod traits;

pub use band::{BandBreakoutFactory, BandOscillatorFactory, BandState, BandStrategy, BandVariant};
pub use bracket::{BracketFactory, BracketState, BracketStrategy};
pub use journal::Journal;
pub use ledger::{split_quantity, PositionLedger};
pub use plan::{BuyStep, QuantitySpec, RangeEntry};
pub use registry::{StrategyFactory, StrategyRegistry};
pub use ripple::{RippleFactory, RippleState, RippleStrategy};
pub use stops::{Breach, StopPolicy, StopTracker};
pub use targets::{TargetsFactory, TargetsState, TargetsStrategy};
pub use trailing::{TrailingFactory, TrailingState, TrailingStrategy};
pub use traits::{Strategy, StrategyOptions, StrategyStatus};
