//! Counter delta math

use crate::units::Energy;
use tracing::warn;

/// Energy consumed between two raw counter readings.
///
/// A reading lower than the previous one means the counter wrapped at `max`.
/// With an unknown `max` (zero) the interval is reported as zero rather than
/// guessing.
pub fn calculate_energy_delta(current: Energy, previous: Energy, max: Energy) -> Energy {
    if current >= previous {
        return current - previous;
    }

    if max.is_zero() {
        warn!(
            current = current.micro_joules(),
            previous = previous.micro_joules(),
            "Energy counter went backwards with unknown wrap point, ignoring interval"
        );
        return Energy::ZERO;
    }

    (max - previous) + current
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uj(v: u64) -> Energy {
        Energy::from_micro_joules(v)
    }

    #[test]
    fn test_delta_without_wrap() {
        assert_eq!(calculate_energy_delta(uj(150), uj(100), uj(1000)), uj(50));
        assert_eq!(calculate_energy_delta(uj(100), uj(100), uj(1000)), uj(0));
    }

    #[test]
    fn test_delta_with_wrap() {
        assert_eq!(calculate_energy_delta(uj(5), uj(990), uj(1000)), uj(15));
    }

    #[test]
    fn test_delta_with_unknown_max() {
        assert_eq!(calculate_energy_delta(uj(5), uj(990), Energy::ZERO), Energy::ZERO);
    }

    #[test]
    fn test_delta_previous_beyond_max() {
        // A previous value above max would underflow; it saturates instead
        assert_eq!(calculate_energy_delta(uj(5), uj(2000), uj(1000)), uj(5));
    }
}
