//! Exponential backoff with optional full jitter (§4.6.3).

use rand::Rng;

/// Raw (pre-jitter) delay for the N-th attempt (1-based): `min(cap, base *
/// 2^(N-1))`.
pub fn raw_delay_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let attempt = attempt.max(1);
    let shift = attempt - 1;
    let scaled = if shift >= 63 {
        cap_ms
    } else {
        base_ms.saturating_mul(1u64 << shift)
    };
    scaled.min(cap_ms)
}

/// Jittered delay: uniform in `[0, raw)` when `jitter` is set, else `raw`
/// unchanged. Matches the boundary test in §8:
/// `calculate_reconnection_backoff(n, {jitter:false, base:500, cap:10_000})`
/// yields `500, 1000, 2000, 4000, 8000, 10000, 10000, ...`.
pub fn calculate_reconnection_backoff(attempt: u32, base_ms: u64, cap_ms: u64, jitter: bool) -> u64 {
    let raw = raw_delay_ms(attempt, base_ms, cap_ms);
    if jitter && raw > 0 {
        rand::thread_rng().gen_range(0..raw)
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_spec_sequence_without_jitter() {
        let expected = [500u64, 1000, 2000, 4000, 8000, 10_000, 10_000, 10_000];
        for (i, want) in expected.iter().enumerate() {
            let attempt = (i + 1) as u32;
            assert_eq!(
                calculate_reconnection_backoff(attempt, 500, 10_000, false),
                *want,
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        for attempt in 1..8 {
            let raw = raw_delay_ms(attempt, 500, 10_000);
            let jittered = calculate_reconnection_backoff(attempt, 500, 10_000, true);
            assert!(jittered < raw.max(1));
        }
    }
}
