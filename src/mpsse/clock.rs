//! MPSSE clock divisor computation.
//!
//! The engine clock is `base / (2 * (divisor + 1))` with a 16-bit divisor.
//! H-type chips choose between a 60 MHz base (prescaler off) and 12 MHz
//! (divide-by-5 on); the FT2232C/D only has the 12 MHz base.

use crate::constants::{MPSSE_CLK_DIV5, MPSSE_CLK_H};
use crate::error::{Result, UnsupportedConfig};
use crate::types::ChipType;

/// Above this rate H-type chips switch to the 60 MHz base.
const DIV5_THRESHOLD: u32 = 6_000_000;

/// A resolved MPSSE clock setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockConfig {
    /// Rate asked for, in Hz.
    pub requested: u32,
    /// Rate the engine will actually run at, in Hz.
    pub achieved: u32,
    /// Value for the TCK_DIVISOR command.
    pub divisor: u16,
    /// Master clock the divisor applies to.
    pub base_hz: u32,
    /// Prescaler setting to send first; `None` on chips without the toggle.
    pub div5: Option<bool>,
}

/// Lowest and highest rates achievable on `chip`.
pub fn clock_range(chip: ChipType) -> (u32, u32) {
    let max = if chip.has_div5_toggle() {
        MPSSE_CLK_H / 2
    } else {
        MPSSE_CLK_DIV5 / 2
    };
    (MPSSE_CLK_DIV5 / (2 * 65536) + 1, max)
}

/// Pick base clock and divisor for `hz`.
///
/// The divisor is `round(base / (2 * hz)) - 1`. Rates outside
/// [`clock_range`] are rejected rather than clamped.
pub fn compute_clock(chip: ChipType, hz: u32) -> Result<ClockConfig> {
    let (min, max) = clock_range(chip);
    let out_of_range = || UnsupportedConfig::ClockOutOfRange {
        requested: hz,
        min,
        max,
    };
    if hz < min || hz > max {
        return Err(out_of_range().into());
    }

    let (base_hz, div5) = if !chip.has_div5_toggle() {
        (MPSSE_CLK_DIV5, None)
    } else if hz > DIV5_THRESHOLD {
        (MPSSE_CLK_H, Some(false))
    } else {
        (MPSSE_CLK_DIV5, Some(true))
    };

    let two_hz = 2 * hz as u64;
    let rounded = (base_hz as u64 + two_hz / 2) / two_hz;
    let divisor = rounded.saturating_sub(1);
    if divisor > u16::MAX as u64 {
        return Err(out_of_range().into());
    }
    let divisor = divisor as u16;

    Ok(ClockConfig {
        requested: hz,
        achieved: achieved_rate(base_hz, divisor),
        divisor,
        base_hz,
        div5,
    })
}

/// Clock produced by `divisor` on a `base_hz` master clock.
#[inline]
pub fn achieved_rate(base_hz: u32, divisor: u16) -> u32 {
    base_hz / (2 * (divisor as u32 + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorKind};

    #[test]
    fn classic_divisors() {
        let c = compute_clock(ChipType::Ft2232C, 1_000_000).unwrap();
        assert_eq!((c.divisor, c.achieved, c.div5), (5, 1_000_000, None));

        let c = compute_clock(ChipType::Ft2232C, 100_000).unwrap();
        assert_eq!((c.divisor, c.achieved), (59, 100_000));

        let c = compute_clock(ChipType::Ft2232C, 400_000).unwrap();
        assert_eq!((c.divisor, c.achieved), (14, 400_000));

        let c = compute_clock(ChipType::Ft2232C, 6_000_000).unwrap();
        assert_eq!((c.divisor, c.achieved), (0, 6_000_000));
    }

    #[test]
    fn h_type_uses_fast_base_above_6mhz() {
        let c = compute_clock(ChipType::Ft232H, 10_000_000).unwrap();
        assert_eq!(c.base_hz, 60_000_000);
        assert_eq!(c.div5, Some(false));
        assert_eq!((c.divisor, c.achieved), (2, 10_000_000));

        let c = compute_clock(ChipType::Ft232H, 30_000_000).unwrap();
        assert_eq!((c.divisor, c.achieved), (0, 30_000_000));

        let c = compute_clock(ChipType::Ft2232H, 1_000_000).unwrap();
        assert_eq!(c.base_hz, 12_000_000);
        assert_eq!(c.div5, Some(true));
    }

    #[test]
    fn rounding_picks_nearest() {
        // 12 MHz / (2 * 7_000) = 857.14 -> 857, divisor 856
        let c = compute_clock(ChipType::Ft2232C, 7_000).unwrap();
        assert_eq!(c.divisor, 856);
        // 12 MHz / (2 * 4_000_000) = 1.5 -> 2, divisor 1
        let c = compute_clock(ChipType::Ft2232C, 4_000_000).unwrap();
        assert_eq!((c.divisor, c.achieved), (1, 3_000_000));
    }

    #[test]
    fn out_of_range_rejected() {
        for (chip, hz) in [
            (ChipType::Ft2232C, 6_000_001),
            (ChipType::Ft232H, 30_000_001),
            (ChipType::Ft232H, 0),
            (ChipType::Ft232H, 91),
        ] {
            let err = compute_clock(chip, hz).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedConfig, "{chip:?} {hz}");
            assert!(matches!(
                err,
                Error::Unsupported(UnsupportedConfig::ClockOutOfRange { requested, .. }) if requested == hz
            ));
        }
    }

    #[test]
    fn slowest_rate_fits_divisor() {
        let (min, _) = clock_range(ChipType::Ft232H);
        let c = compute_clock(ChipType::Ft232H, min).unwrap();
        assert!(c.divisor > 60_000);
    }
}
