//! Fixed-point exponentially weighted moving average.
//!
//! The average is kept as a scaled integer (`SCALE` fraction bits) and decays
//! by `1 - 2^-STABILITY_SHIFT` per tick, so the averaging interval is about
//! `2^STABILITY_SHIFT` ticks. All arithmetic is integer shifts; the packet
//! path never touches floating point.

/// Fraction bits carried by [`RateEwma::average`].
pub const SCALE: u32 = 10;

/// `alpha = 1 - 2^-STABILITY_SHIFT`; larger means smoother and slower.
pub const STABILITY_SHIFT: u32 = 4;

/// Rounding compensation folded into every step.
const COMPENSATION: i64 = 1 << (STABILITY_SHIFT - 1);

/// A gap of this many sample-free ticks clamps the average straight to zero
/// instead of stepping the decay tick by tick.
const ZERO_DECAY_CUTOFF: u64 = 100;

/// Tick-driven EWMA over non-negative integer samples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateEwma {
    /// Scaled running average; never negative.
    avg: i64,
    /// Tick of the most recent update.
    last: u64,
}

impl RateEwma {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `sample` in at tick `now`, first inserting zero samples for every
    /// tick elapsed since the previous update.
    ///
    /// A zero sample at the current tick is a no-op: no time has passed and
    /// there is nothing to fold, so aging passes repeated within one tick
    /// leave the average where it is.
    pub fn update(&mut self, now: u64, sample: u64) {
        let elapsed = now.saturating_sub(self.last);
        if elapsed == 0 && sample == 0 {
            return;
        }
        if elapsed > 1 {
            self.decay(elapsed - 1);
        }
        if now > self.last {
            self.last = now;
        }
        let scaled = (sample as i64) << SCALE;
        self.avg += (scaled - self.avg + COMPENSATION) >> STABILITY_SHIFT;
    }

    /// Scaled average (fixed point, [`SCALE`] fraction bits).
    pub fn average(&self) -> u64 {
        self.avg as u64
    }

    /// Tick of the most recent update.
    pub fn last_update(&self) -> u64 {
        self.last
    }

    fn decay(&mut self, zeros: u64) {
        if zeros >= ZERO_DECAY_CUTOFF {
            self.avg = 0;
            return;
        }
        for _ in 0..zeros {
            if self.avg == 0 {
                break;
            }
            self.avg += (COMPENSATION - self.avg) >> STABILITY_SHIFT;
        }
    }
}
