//! Split planner
//!
//! Pure function turning (t0, Q, N, D, randomize) into N slices whose integer
//! quantities sum exactly to Q and whose scheduled times all fall inside the
//! closed window [t0, t0 + D]. The exact sum is guaranteed by assigning the
//! last slice the remainder; the window is hard-enforced by clamping; the
//! first and last slices are never jittered so the plan honours the caller's
//! window endpoints exactly.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlannerError {
    #[error("num_splits must be >= 1")]
    InvalidNumSplits,

    #[error("total_quantity must be > 0")]
    InvalidQuantity,

    #[error("duration_minutes must be >= 0")]
    InvalidDuration,
}

/// One child of the computed plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSlice {
    pub quantity: i32,
    pub sequence_number: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Compute quantities and scheduled times for the child slices.
///
/// With `randomize` off the output is fully deterministic: every slice except
/// the last gets `floor(Q / N)` and slices are spaced evenly across the
/// window. With `randomize` on, all but the last quantity get a uniform ±20%
/// variance (clamped at zero) and interior scheduled times get ±30% of the
/// base interval; the last quantity absorbs the remainder either way.
pub fn calculate_split_schedule(
    parent_created_at: DateTime<Utc>,
    total_quantity: i32,
    num_splits: i32,
    duration_minutes: i32,
    randomize: bool,
) -> Result<Vec<SplitSlice>, PlannerError> {
    if num_splits < 1 {
        return Err(PlannerError::InvalidNumSplits);
    }
    if total_quantity <= 0 {
        return Err(PlannerError::InvalidQuantity);
    }
    if duration_minutes < 0 {
        return Err(PlannerError::InvalidDuration);
    }

    let n = num_splits as usize;
    let base_quantity = f64::from(total_quantity) / f64::from(num_splits);
    let mut rng = rand::thread_rng();

    let mut quantities: Vec<i32> = Vec::with_capacity(n);
    if randomize && num_splits > 1 {
        for _ in 0..n - 1 {
            let variance: f64 = rng.gen_range(-0.2..=0.2);
            let qty = (base_quantity * (1.0 + variance)) as i32;
            quantities.push(qty.max(0));
        }
    } else {
        for _ in 0..n - 1 {
            quantities.push(base_quantity as i32);
        }
    }
    let assigned: i32 = quantities.iter().sum();
    quantities.push(total_quantity - assigned);

    let window_end = parent_created_at + Duration::minutes(i64::from(duration_minutes));
    let base_interval_minutes = if num_splits > 1 {
        f64::from(duration_minutes) / f64::from(num_splits - 1)
    } else {
        0.0
    };

    let mut slices = Vec::with_capacity(n);
    for i in 0..n {
        let base_time =
            parent_created_at + duration_from_minutes(i as f64 * base_interval_minutes);

        let mut scheduled_at = if randomize && num_splits > 1 && i > 0 && i < n - 1 {
            let max_variance = base_interval_minutes * 0.3;
            let jitter: f64 = rng.gen_range(-max_variance..=max_variance);
            base_time + duration_from_minutes(jitter)
        } else {
            base_time
        };

        // Hard window boundaries.
        if scheduled_at < parent_created_at {
            scheduled_at = parent_created_at;
        }
        if scheduled_at > window_end {
            scheduled_at = window_end;
        }

        slices.push(SplitSlice {
            quantity: quantities[i],
            sequence_number: (i + 1) as i32,
            scheduled_at,
        });
    }

    debug_assert_eq!(
        slices.iter().map(|s| s.quantity).sum::<i32>(),
        total_quantity
    );
    debug_assert!(
        slices
            .iter()
            .all(|s| s.scheduled_at >= parent_created_at && s.scheduled_at <= window_end)
    );

    Ok(slices)
}

fn duration_from_minutes(minutes: f64) -> Duration {
    Duration::milliseconds((minutes * 60_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_even_split_without_randomize() {
        let slices = calculate_split_schedule(t0(), 100, 5, 60, false).unwrap();

        assert_eq!(slices.len(), 5);
        for s in &slices {
            assert_eq!(s.quantity, 20);
        }
        // t0, t0+15m, t0+30m, t0+45m, t0+60m
        for (i, s) in slices.iter().enumerate() {
            assert_eq!(s.sequence_number as usize, i + 1);
            assert_eq!(s.scheduled_at, t0() + Duration::minutes(15 * i as i64));
        }
    }

    #[test]
    fn test_remainder_goes_to_last_slice() {
        let slices = calculate_split_schedule(t0(), 103, 5, 60, false).unwrap();
        assert_eq!(
            slices.iter().map(|s| s.quantity).collect::<Vec<_>>(),
            vec![20, 20, 20, 20, 23]
        );
    }

    #[test]
    fn test_single_split() {
        let slices = calculate_split_schedule(t0(), 100, 1, 60, false).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].quantity, 100);
        assert_eq!(slices[0].sequence_number, 1);
        assert_eq!(slices[0].scheduled_at, t0());
    }

    #[test]
    fn test_single_split_zero_duration() {
        let slices = calculate_split_schedule(t0(), 50, 1, 0, false).unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].scheduled_at, t0());
    }

    #[test]
    fn test_randomized_quantities_sum_and_window() {
        for _ in 0..50 {
            let slices = calculate_split_schedule(t0(), 1000, 10, 120, true).unwrap();
            assert_eq!(slices.len(), 10);
            assert_eq!(slices.iter().map(|s| s.quantity).sum::<i32>(), 1000);

            let end = t0() + Duration::minutes(120);
            for s in &slices {
                assert!(s.scheduled_at >= t0() && s.scheduled_at <= end);
            }
            // endpoints are never jittered
            assert_eq!(slices.first().unwrap().scheduled_at, t0());
            assert_eq!(slices.last().unwrap().scheduled_at, end);
        }
    }

    #[test]
    fn test_randomized_variance_bounds() {
        // base quantity 100; ±20% variance keeps all but the last in [80, 120]
        for _ in 0..20 {
            let slices = calculate_split_schedule(t0(), 1000, 10, 60, true).unwrap();
            for s in &slices[..9] {
                assert!(
                    (80..=120).contains(&s.quantity),
                    "quantity {} outside variance bounds",
                    s.quantity
                );
            }
        }
    }

    #[test]
    fn test_deterministic_without_randomize() {
        let a = calculate_split_schedule(t0(), 999, 7, 45, false).unwrap();
        let b = calculate_split_schedule(t0(), 999, 7, 45, false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(
            calculate_split_schedule(t0(), 100, 0, 60, false),
            Err(PlannerError::InvalidNumSplits)
        );
        assert_eq!(
            calculate_split_schedule(t0(), 0, 5, 60, false),
            Err(PlannerError::InvalidQuantity)
        );
        assert_eq!(
            calculate_split_schedule(t0(), 100, 5, -1, false),
            Err(PlannerError::InvalidDuration)
        );
    }

    #[test]
    fn test_sequence_numbers_are_one_based_and_ordered() {
        let slices = calculate_split_schedule(t0(), 60, 6, 30, true).unwrap();
        let seqs: Vec<i32> = slices.iter().map(|s| s.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }
}
