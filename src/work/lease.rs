use std::time::Duration;

/// Exponents beyond this stop doubling; `2^30` leases are already decades long
/// for any realistic base duration.
pub const MAX_LEASE_EXPONENT: u32 = 30;

/// `base × 2^exponent`, saturating instead of overflowing.
pub fn lease_duration_for_exponent(base: Duration, exponent: u32) -> Duration {
    let multiplier = 1u32 << exponent.min(MAX_LEASE_EXPONENT);
    base.checked_mul(multiplier).unwrap_or(Duration::MAX)
}

/// Expiry instant (epoch millis) for a lease granted at `now_millis`.
pub fn lease_expiry_millis(now_millis: i64, base: Duration, exponent: u32) -> i64 {
    let duration = lease_duration_for_exponent(base, exponent);
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    now_millis.saturating_add(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_doubles_per_exponent() {
        let base = Duration::from_secs(600);
        assert_eq!(lease_duration_for_exponent(base, 0), base);
        assert_eq!(lease_duration_for_exponent(base, 1), Duration::from_secs(1200));
        assert_eq!(lease_duration_for_exponent(base, 3), Duration::from_secs(4800));
    }

    #[test]
    fn test_lease_growth_saturates() {
        let base = Duration::from_secs(u64::MAX / 2);
        assert_eq!(lease_duration_for_exponent(base, 4), Duration::MAX);
        assert_eq!(
            lease_duration_for_exponent(Duration::from_secs(1), 200),
            Duration::from_secs(1 << MAX_LEASE_EXPONENT)
        );
        assert_eq!(lease_expiry_millis(i64::MAX - 5, Duration::from_secs(10), 0), i64::MAX);
    }

    #[test]
    fn test_expiry_from_now() {
        assert_eq!(lease_expiry_millis(1_000, Duration::from_secs(5), 0), 6_000);
        assert_eq!(lease_expiry_millis(1_000, Duration::from_secs(5), 2), 21_000);
    }
}
