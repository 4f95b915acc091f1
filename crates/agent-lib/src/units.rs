//! Typed energy and power quantities
//!
//! Energy is kept as an unsigned microjoule count so that long-running
//! totals never drift; power is a float in microwatts and is only derived
//! from energy over an elapsed interval.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub};

/// Energy in microjoules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Energy(u64);

impl Energy {
    pub const ZERO: Energy = Energy(0);
    pub const MICRO_JOULE: Energy = Energy(1);
    pub const MILLI_JOULE: Energy = Energy(1_000);
    pub const JOULE: Energy = Energy(1_000_000);
    pub const KILO_JOULE: Energy = Energy(1_000_000_000);

    pub const fn from_micro_joules(uj: u64) -> Self {
        Self(uj)
    }

    /// Convert from joules, truncating below one microjoule.
    /// Negative and non-finite inputs map to zero.
    pub fn from_joules(joules: f64) -> Self {
        Self::from_micro_joules_f64(joules * Self::JOULE.0 as f64)
    }

    pub(crate) fn from_micro_joules_f64(uj: f64) -> Self {
        if uj.is_finite() && uj > 0.0 {
            Self(uj as u64)
        } else {
            Self::ZERO
        }
    }

    pub const fn micro_joules(self) -> u64 {
        self.0
    }

    pub fn joules(self) -> f64 {
        self.0 as f64 / Self::JOULE.0 as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, rhs: Energy) -> Energy {
        Energy(self.0.saturating_sub(rhs.0))
    }

    /// Scale by a ratio, e.g. a CPU-time share. The result is never negative.
    pub fn scale(self, ratio: f64) -> Energy {
        Self::from_micro_joules_f64(self.0 as f64 * ratio)
    }
}

impl Add for Energy {
    type Output = Energy;

    fn add(self, rhs: Energy) -> Energy {
        Energy(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Energy {
    fn add_assign(&mut self, rhs: Energy) {
        *self = *self + rhs;
    }
}

impl Sub for Energy {
    type Output = Energy;

    fn sub(self, rhs: Energy) -> Energy {
        self.saturating_sub(rhs)
    }
}

impl Sum for Energy {
    fn sum<I: Iterator<Item = Energy>>(iter: I) -> Energy {
        iter.fold(Energy::ZERO, Add::add)
    }
}

impl fmt::Display for Energy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}J", self.joules())
    }
}

/// Power in microwatts
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Power(f64);

impl Power {
    pub const ZERO: Power = Power(0.0);
    pub const MICRO_WATT: Power = Power(1.0);
    pub const MILLI_WATT: Power = Power(1_000.0);
    pub const WATT: Power = Power(1_000_000.0);
    pub const KILO_WATT: Power = Power(1_000_000_000.0);

    pub fn from_micro_watts(uw: f64) -> Self {
        Self(uw)
    }

    pub fn from_watts(watts: f64) -> Self {
        Self(watts * Self::WATT.0)
    }

    /// Average power for `energy` spent over `elapsed_secs`.
    pub fn from_energy(energy: Energy, elapsed_secs: f64) -> Self {
        if !elapsed_secs.is_finite() || elapsed_secs <= 0.0 {
            return Self::ZERO;
        }
        Self(energy.micro_joules() as f64 / elapsed_secs)
    }

    pub fn micro_watts(self) -> f64 {
        self.0
    }

    pub fn watts(self) -> f64 {
        self.0 / Self::WATT.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Energy spent at this power over `secs`
    pub fn energy_over(self, secs: f64) -> Energy {
        Energy::from_micro_joules_f64(self.0 * secs)
    }
}

impl Add for Power {
    type Output = Power;

    fn add(self, rhs: Power) -> Power {
        Power(self.0 + rhs.0)
    }
}

impl AddAssign for Power {
    fn add_assign(&mut self, rhs: Power) {
        self.0 += rhs.0;
    }
}

impl Sub for Power {
    type Output = Power;

    fn sub(self, rhs: Power) -> Power {
        Power(self.0 - rhs.0)
    }
}

impl Mul<f64> for Power {
    type Output = Power;

    fn mul(self, rhs: f64) -> Power {
        Power(self.0 * rhs)
    }
}

impl Sum for Power {
    fn sum<I: Iterator<Item = Power>>(iter: I) -> Power {
        iter.fold(Power::ZERO, Add::add)
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}W", self.watts())
    }
}
