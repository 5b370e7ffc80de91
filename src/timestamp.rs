//! Stream-tick / millisecond timestamp math
//!
//! Stateless affine rescaling between a stream's native time-base ticks and
//! milliseconds, offset by the stream start time. All rounding is toward
//! negative infinity so that seeks snap to the frame at or before the target.

use ffmpeg_next::Rational;

/// Converter between native stream ticks and milliseconds.
///
/// Copy of the stream's time-base plus start-time, captured once when the
/// stream is probed; stage threads share it read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickScale {
    num: i64,
    den: i64,
    start_time: i64,
}

impl TickScale {
    /// Build from a stream time-base and start time (in ticks).
    ///
    /// A degenerate time-base falls back to milliseconds (1/1000) so the
    /// conversions stay well-defined.
    pub fn new(time_base: Rational, start_time: i64) -> Self {
        let (num, den) = if time_base.numerator() <= 0 || time_base.denominator() <= 0 {
            (1, 1000)
        } else {
            (time_base.numerator() as i64, time_base.denominator() as i64)
        };
        Self {
            num,
            den,
            start_time,
        }
    }

    /// Stream start time in native ticks.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Convert a native-tick timestamp to milliseconds from stream start.
    pub fn to_millis(&self, pts: i64) -> i64 {
        // (pts - start) * num/den seconds, scaled to ms, floored
        let rel = (pts - self.start_time) as i128;
        floor_div(rel * 1000 * self.num as i128, self.den as i128)
    }

    /// Convert milliseconds from stream start to a native-tick timestamp.
    pub fn to_ticks(&self, ms: i64) -> i64 {
        let ticks = floor_div(ms as i128 * self.den as i128, 1000 * self.num as i128);
        ticks + self.start_time
    }
}

fn floor_div(n: i128, d: i128) -> i64 {
    n.div_euclid(d) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_90khz() {
        let ts = TickScale::new(Rational::new(1, 90000), 0);
        assert_eq!(ts.to_millis(90000), 1000);
        assert_eq!(ts.to_ticks(1000), 90000);
        // ms grid is coarser than the tick grid: ticks -> ms -> ticks may
        // floor, but never by more than one millisecond worth of ticks
        let pts = 90001;
        let back = ts.to_ticks(ts.to_millis(pts));
        assert!(back <= pts && pts - back < 90);
        // ms -> ticks -> ms is exact
        for ms in [0, 1, 33, 999, 5000] {
            assert_eq!(ts.to_millis(ts.to_ticks(ms)), ms);
        }
    }

    #[test]
    fn test_start_time_offset() {
        let ts = TickScale::new(Rational::new(1, 1000), 500);
        assert_eq!(ts.to_millis(500), 0);
        assert_eq!(ts.to_millis(1500), 1000);
        assert_eq!(ts.to_ticks(0), 500);
    }

    #[test]
    fn test_floor_rounding_negative() {
        let ts = TickScale::new(Rational::new(1, 30), 0);
        // one tick before start is a negative position, floored
        assert_eq!(ts.to_millis(-1), -34);
    }

    #[test]
    fn test_coarse_time_base_inverse_within_one_tick() {
        // NTSC-ish time base coarser than 1ms
        let ts = TickScale::new(Rational::new(1001, 30000), 0);
        for pts in [0, 1, 7, 100, 2997] {
            let back = ts.to_ticks(ts.to_millis(pts));
            assert!((pts - back).abs() <= 1, "pts={pts} back={back}");
        }
    }

    #[test]
    fn test_degenerate_time_base() {
        let ts = TickScale::new(Rational::new(0, 0), 0);
        assert_eq!(ts.to_millis(250), 250);
        assert_eq!(ts.to_ticks(250), 250);
    }
}
