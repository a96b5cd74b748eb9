//! Virtual clock for the simulated device.

/// Counts simulated ticks. While frozen, ticks are swallowed.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    /// Ticks that actually advanced the clock.
    elapsed: u64,
    /// Ticks offered while frozen.
    skipped: u64,
    frozen: bool,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `ticks` to the clock. Returns how many took effect.
    pub fn advance(&mut self, ticks: u64) -> u64 {
        if self.frozen {
            self.skipped += ticks;
            return 0;
        }
        self.elapsed += ticks;
        ticks
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
