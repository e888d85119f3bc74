//! Tic-to-wall-time rendering.
//!
//! One tic is 100/6 ns (a 60 MHz clock period); conversions stay in
//! integer arithmetic.

use crate::Tic;

/// Nanoseconds elapsed after `tic` tics.
pub fn tics_to_ns(tic: Tic) -> u64 {
    tic.saturating_mul(50) / 3
}

/// Full `mmm:ss.mmm'µµµ"nnnn`-style rendering:
/// minutes:seconds.milliseconds'microseconds"nanoseconds.
///
/// ```
/// assert_eq!(iti1480a::time::tic_to_time(0), "000:00.000'000\"000n");
/// ```
pub fn tic_to_time(tic: Tic) -> String {
    let ns = tics_to_ns(tic);
    let (rest, nano) = (ns / 1000, ns % 1000);
    let (rest, micro) = (rest / 1000, rest % 1000);
    let (rest, milli) = (rest / 1000, rest % 1000);
    let (minute, second) = (rest / 60, rest % 60);
    format!(
        "{:03}:{:02}.{:03}'{:03}\"{:03}n",
        minute, second, milli, micro, nano,
    )
}

/// Short rendering: the most significant non-zero unit pair.
pub fn short_tic_to_time(tic: Tic) -> String {
    let ns = tics_to_ns(tic);
    let (rest, nano) = (ns / 1000, ns % 1000);
    let (rest, micro) = (rest / 1000, rest % 1000);
    let (rest, milli) = (rest / 1000, rest % 1000);
    let (minute, second) = (rest / 60, rest % 60);
    if minute > 0 || second > 0 {
        format!("{:03}:{:02}", minute, second)
    } else if milli > 0 {
        format!("{} ms, {} us", milli, micro)
    } else {
        format!("{} us, {} ns", micro, nano)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_conversion_is_exact_per_three_tics() {
        assert_eq!(tics_to_ns(0), 0);
        assert_eq!(tics_to_ns(3), 50);
        assert_eq!(tics_to_ns(6), 100);
        assert_eq!(tics_to_ns(60_000_000), 1_000_000_000);
    }

    #[test]
    fn full_rendering() {
        assert_eq!(tic_to_time(0), "000:00.000'000\"000n");
        // 60e6 tics = exactly one second.
        assert_eq!(tic_to_time(60_000_000), "000:01.000'000\"000n");
        // 90 seconds and a bit.
        assert_eq!(
            tic_to_time(90 * 60_000_000 + 3),
            "001:30.000'000\"050n",
        );
    }

    #[test]
    fn short_rendering() {
        assert_eq!(short_tic_to_time(90 * 60_000_000), "001:30");
        assert_eq!(short_tic_to_time(660_000), "11 ms, 0 us");
        assert_eq!(short_tic_to_time(150), "2 us, 500 ns");
        assert_eq!(short_tic_to_time(3), "0 us, 50 ns");
    }
}
