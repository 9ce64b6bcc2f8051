//! Integer duration arithmetic in tenths of a second.
//!
//! A tenth of a second is the planner's rounding unit; working in integer
//! tenths keeps plan totals exact.

/// Seconds to tenths, rounded.
pub(crate) fn to_tenths(secs: f64) -> i64 {
    if !secs.is_finite() {
        return 0;
    }
    (secs * 10.0).round() as i64
}

pub(crate) fn from_tenths(tenths: i64) -> f64 {
    tenths as f64 / 10.0
}

/// Move `delta` tenths into (positive) or out of (negative) eligible slots
/// without crossing their bounds. Returns whatever could not be placed.
pub(crate) fn water_fill(
    durations: &mut [i64],
    delta: i64,
    lower: &[i64],
    upper: &[i64],
    eligible: &[bool],
) -> i64 {
    let mut delta = delta;
    while delta != 0 {
        let sign = delta.signum();
        let room = |i: usize, durations: &[i64]| {
            if sign > 0 {
                upper[i] - durations[i]
            } else {
                durations[i] - lower[i]
            }
        };

        let candidates: Vec<usize> = (0..durations.len())
            .filter(|&i| eligible[i] && room(i, durations) > 0)
            .collect();
        if candidates.is_empty() {
            break;
        }

        let share = (delta.abs() / candidates.len() as i64).max(1);
        for i in candidates {
            if delta == 0 {
                break;
            }
            let step = share.min(room(i, durations)).min(delta.abs());
            durations[i] += step * sign;
            delta -= step * sign;
        }
    }
    delta
}

/// Spread `delta` evenly over eligible slots ignoring bounds; earlier slots
/// take the indivisible remainder.
pub(crate) fn spread_evenly(durations: &mut [i64], delta: i64, eligible: &[bool]) {
    let slots: Vec<usize> = (0..durations.len()).filter(|&i| eligible[i]).collect();
    if slots.is_empty() {
        return;
    }
    let count = slots.len() as i64;
    let per = delta / count;
    let extra = delta % count;
    for (n, i) in slots.into_iter().enumerate() {
        durations[i] += per;
        if (n as i64) < extra.abs() {
            durations[i] += extra.signum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenths_conversion() {
        assert_eq!(to_tenths(14.25), 143);
        assert_eq!(to_tenths(3.0), 30);
        assert_eq!(from_tenths(171), 17.1);
    }

    #[test]
    fn test_water_fill_respects_bounds() {
        let mut d = vec![30, 80, 40, 80];
        let left = water_fill(&mut d, 30, &[20; 4], &[80; 4], &[false, true, true, true]);
        assert_eq!(left, 0);
        assert_eq!(d, vec![30, 80, 70, 80]);
    }

    #[test]
    fn test_water_fill_reports_leftover() {
        let mut d = vec![80, 75];
        let left = water_fill(&mut d, 10, &[20; 2], &[80; 2], &[true, true]);
        assert_eq!(left, 5);
        assert_eq!(d, vec![80, 80]);
    }

    #[test]
    fn test_water_fill_removes_time() {
        let mut d = vec![30, 50, 50];
        let left = water_fill(&mut d, -41, &[20; 3], &[80; 3], &[false, true, true]);
        assert_eq!(left, 0);
        assert_eq!(d.iter().sum::<i64>(), 130 - 41);
        assert!(d[1] >= 20 && d[2] >= 20);
    }

    #[test]
    fn test_spread_evenly() {
        let mut d = vec![30, 80, 80, 80, 80];
        spread_evenly(&mut d, 250, &[false, true, true, true, true]);
        assert_eq!(d, vec![30, 143, 143, 142, 142]);
    }
}
