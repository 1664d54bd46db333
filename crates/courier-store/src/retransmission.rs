//! Retransmission timing shared by the store implementations.

use std::time::Duration;

use courier_core::RECORD_HEADER_LENGTH;

/// Cap on the backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 8;

/// Current time in Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn latency_millis(max_latency: Duration) -> i64 {
    max_latency.as_millis().min(i64::MAX as u128) as i64
}

/// When a message sent for the `tx_count`-th time may be sent again: two
/// latencies, doubling with each transmission.
pub fn calculate_expiry(now: i64, max_latency: Duration, tx_count: u32) -> i64 {
    let round_trip = latency_millis(max_latency).saturating_mul(2);
    let shift = tx_count.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
    now.saturating_add(round_trip.saturating_mul(1i64 << shift))
}

/// Whether a message is due: its timer expired, or the previous
/// transmission's estimated arrival is later than this transport would
/// manage.
pub fn is_due(expiry: i64, eta: i64, now: i64, max_latency: Duration) -> bool {
    expiry <= now || eta > now.saturating_add(latency_millis(max_latency))
}

/// Bytes a message occupies on the wire as a record.
pub(crate) fn record_length(raw_length: usize) -> u64 {
    (RECORD_HEADER_LENGTH + raw_length) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_doubles_per_transmission() {
        let latency = Duration::from_millis(100);
        assert_eq!(calculate_expiry(1000, latency, 1), 1200);
        assert_eq!(calculate_expiry(1000, latency, 2), 1400);
        assert_eq!(calculate_expiry(1000, latency, 3), 1800);
        assert_eq!(
            calculate_expiry(0, latency, 100),
            calculate_expiry(0, latency, MAX_BACKOFF_SHIFT + 1)
        );
    }

    #[test]
    fn test_due_when_expired_or_overtaken() {
        let latency = Duration::from_millis(100);
        assert!(is_due(0, 0, 500, latency));
        assert!(!is_due(600, 550, 500, latency));
        // Sent earlier over a slow transport: a fast one may overtake.
        assert!(is_due(10_000, 9_000, 500, latency));
    }

    #[test]
    fn test_huge_latency_saturates() {
        assert_eq!(calculate_expiry(1, Duration::MAX, 1), i64::MAX);
    }

    proptest::proptest! {
        #[test]
        fn prop_expiry_never_shrinks(
            now in 0i64..1 << 50,
            latency_ms in 0u64..1 << 20,
            tx in 1u32..64,
        ) {
            let latency = Duration::from_millis(latency_ms);
            let this = calculate_expiry(now, latency, tx);
            let next = calculate_expiry(now, latency, tx + 1);
            proptest::prop_assert!(this >= now);
            proptest::prop_assert!(next >= this);
        }
    }
}
