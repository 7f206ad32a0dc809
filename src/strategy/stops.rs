//! Virtual and physical protective stops

use crate::consts::STOP_SAFETY_MARGIN;

/// Whether a stop may move down during a position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopPolicy {
    /// Let a strategy lower its stop on a deliberate regime change.
    /// Off by default: stops only move up.
    pub allow_widening: bool,
}

/// Outcome of checking a bar against the virtual stop
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Breach {
    /// Low stayed above the watch level, or no watch level
    None,
    /// Watch level crossed; place a physical stop at this price
    Place(f64),
    /// Watch level crossed but the physical stop already sits higher
    Kept { candidate: f64, physical: f64 },
}

/// Protective stop of one long position.
///
/// The virtual stop is a watch level kept in software. When a bar's low
/// goes under it, a physical conditional sell is placed slightly below
/// that low. Physical stops are only ever raised.
#[derive(Debug, Clone, Default)]
pub struct StopTracker {
    policy: StopPolicy,
    margin: f64,
    virtual_stop: Option<f64>,
    physical_stop: Option<f64>,
    physical_order: Option<String>,
}

impl StopTracker {
    pub fn new(policy: StopPolicy) -> Self {
        Self::with_margin(policy, STOP_SAFETY_MARGIN)
    }

    pub fn with_margin(policy: StopPolicy, margin: f64) -> Self {
        Self {
            policy,
            margin,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> StopPolicy {
        self.policy
    }

    pub fn virtual_stop(&self) -> Option<f64> {
        self.virtual_stop
    }

    pub fn physical_stop(&self) -> Option<f64> {
        self.physical_stop
    }

    /// Exchange id of the resting physical stop
    pub fn physical_order(&self) -> Option<&str> {
        self.physical_order.as_deref()
    }

    /// Move the watch level. Returns the level now in force; lower levels
    /// are ignored unless the policy allows widening.
    pub fn set_virtual(&mut self, level: f64) -> f64 {
        match self.virtual_stop {
            Some(current) if level < current && !self.policy.allow_widening => current,
            _ => {
                self.virtual_stop = Some(level);
                level
            }
        }
    }

    /// Check `low` against the watch level
    pub fn breach(&self, low: f64) -> Breach {
        let Some(watch) = self.virtual_stop else {
            return Breach::None;
        };
        if low >= watch {
            return Breach::None;
        }
        let candidate = low * (1.0 - self.margin);
        match self.physical_stop {
            Some(physical) if candidate <= physical => Breach::Kept { candidate, physical },
            _ => Breach::Place(candidate),
        }
    }

    /// Whether a physical stop at `level` may replace the current one
    pub fn accepts_physical(&self, level: f64) -> bool {
        match self.physical_stop {
            None => true,
            Some(current) => level > current || (self.policy.allow_widening && level != current),
        }
    }

    /// Record a physical stop that was placed on the exchange
    pub fn promote(&mut self, level: f64, order_id: &str) {
        self.physical_stop = Some(level);
        self.physical_order = Some(order_id.to_string());
    }

    /// Forget the physical stop, after it filled or was replaced by a sell
    pub fn clear_physical(&mut self) {
        self.physical_stop = None;
        self.physical_order = None;
    }

    /// Flat again: drop both levels
    pub fn reset(&mut self) {
        self.virtual_stop = None;
        self.clear_physical();
    }
}
