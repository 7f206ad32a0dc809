/// Commission charged by the simulated exchange on every fill
pub const DEFAULT_FEE_RATE: f64 = 0.0025;

/// Bars handed to a strategy as history before a replay starts feeding
pub const WARMUP_BARS: usize = 20;

/// Order submissions tried while the exchange reports insufficient funds
pub const MAX_ORDER_ATTEMPTS: u32 = 10;

/// Physical stops are placed this fraction below the breaching low
pub const STOP_SAFETY_MARGIN: f64 = 0.01;

/// Buy range as a fraction of the entry-to-stop distance
pub const DEFAULT_BUY_RANGE: f64 = 0.09;

/// Minimum band width for band searches
pub const DEFAULT_BAND_WIDTH: f64 = 0.05;

/// Quantities closer than this are considered equal
pub const EPSILON: f64 = 1e-9;
