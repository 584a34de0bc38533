//! Deterministic guest time (executed instructions → microseconds).
//!
//! Guest time only moves when guest code runs, or when every thread is asleep and the clock is
//! fast-forwarded to the next deadline. A remainder accumulator carries fractional microseconds
//! across calls so short slices still add up.

/// Microsecond guest clock driven by instruction counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestClock {
    cpu_hz: u64,
    now_us: u64,
    /// Remainder of `executed * 1e6 + remainder` divided by `cpu_hz`.
    remainder: u128,
}

impl GuestClock {
    const US_PER_SEC: u128 = 1_000_000;

    pub fn new(cpu_hz: u64) -> Self {
        Self {
            cpu_hz,
            now_us: 0,
            remainder: 0,
        }
    }

    pub fn cpu_hz(&self) -> u64 {
        self.cpu_hz
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    pub fn reset(&mut self) {
        self.now_us = 0;
        self.remainder = 0;
    }

    /// Account `executed` instructions and return the elapsed microseconds.
    pub fn advance(&mut self, executed: u64) -> u64 {
        if executed == 0 || self.cpu_hz == 0 {
            return 0;
        }
        let numer = u128::from(executed) * Self::US_PER_SEC + self.remainder;
        let denom = u128::from(self.cpu_hz);
        let delta = numer / denom;
        self.remainder = numer % denom;
        let delta = u64::try_from(delta).unwrap_or(u64::MAX);
        self.now_us = self.now_us.saturating_add(delta);
        delta
    }

    /// Jump forward to `deadline_us`. Earlier deadlines are ignored.
    pub fn fast_forward(&mut self, deadline_us: u64) {
        if deadline_us > self.now_us {
            self.now_us = deadline_us;
            self.remainder = 0;
        }
    }

    pub(crate) fn raw_parts(&self) -> (u64, u128) {
        (self.now_us, self.remainder)
    }

    pub(crate) fn from_raw_parts(cpu_hz: u64, now_us: u64, remainder: u128) -> Option<Self> {
        (remainder < u128::from(cpu_hz.max(1))).then_some(Self {
            cpu_hz,
            now_us,
            remainder,
        })
    }
}
