//! Absolute/delta counter pair used for every per-flow statistic

/// Tracks the latest absolute value reported by a source together with the
/// amount accumulated since the last report.
///
/// Sources such as conntrack report absolute values that may go backwards
/// when an entry is recreated; in that case the new absolute value is added
/// to the delta in full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counter {
    absolute: u64,
    delta: u64,
}

impl Counter {
    pub fn new(value: u64) -> Self {
        Self {
            absolute: value,
            delta: value,
        }
    }

    /// Record a new absolute value. Returns whether the value changed.
    pub fn set(&mut self, value: u64) -> bool {
        if value == self.absolute {
            return false;
        }
        if value < self.absolute {
            self.delta += value;
        } else {
            self.delta += value - self.absolute;
        }
        self.absolute = value;
        true
    }

    /// Add to both the absolute value and the delta.
    pub fn increase(&mut self, by: u64) {
        self.absolute += by;
        self.delta += by;
    }

    pub fn reset_delta(&mut self) {
        self.delta = 0;
    }

    pub fn reset(&mut self) {
        self.absolute = 0;
        self.delta = 0;
    }

    pub fn reset_and_set(&mut self, value: u64) {
        self.absolute = value;
        self.delta = value;
    }

    pub fn absolute(&self) -> u64 {
        self.absolute
    }

    pub fn delta(&self) -> u64 {
        self.delta
    }

    pub fn is_zero(&self) -> bool {
        self.absolute == 0 && self.delta == 0
    }
}
