//! Property-based tests for the retry policy and payload digests.
//!
//!  - delay(n) = min(2^n * base, cap)
//!  - delay is monotonically non-decreasing in n
//!  - delay never exceeds cap

use proptest::prelude::*;
use serde_json::json;
use tandem_core::backoff::BackoffPolicy;
use tandem_core::hash::PayloadHash;

fn policy_strategy() -> impl Strategy<Value = BackoffPolicy> {
    (0u64..10_000, 0u64..1_000_000).prop_map(|(base, cap)| BackoffPolicy::new(base, cap))
}

proptest! {
    #[test]
    fn delay_is_monotonic(policy in policy_strategy(), n in 0u32..200) {
        prop_assert!(policy.delay_ms(n) <= policy.delay_ms(n + 1));
    }

    #[test]
    fn delay_is_bounded_by_cap(policy in policy_strategy(), n in 0u32..1_000) {
        prop_assert!(policy.delay_ms(n) <= policy.cap_ms);
    }

    #[test]
    fn delay_matches_formula_with_one_second_base(cap in 1_000u64..10_000_000, n in 0u32..40) {
        let policy = BackoffPolicy::new(1_000, cap);
        let expected = (2u128.pow(n) * 1_000).min(cap as u128) as u64;
        prop_assert_eq!(policy.delay_ms(n), expected);
    }

    #[test]
    fn payload_hash_is_deterministic(
        url in "/[a-z]{1,8}(/[a-z0-9]{1,6}){0,3}",
        reps in 0i64..100,
        note in "[a-zA-Z ]{0,12}"
    ) {
        let body = json!({"reps": reps, "note": note});
        prop_assert_eq!(
            PayloadHash::of_request("POST", &url, Some(&body)),
            PayloadHash::of_request("POST", &url, Some(&body.clone()))
        );
    }

    #[test]
    fn payload_hash_separates_bodies(a in 0i64..1_000, b in 0i64..1_000) {
        prop_assume!(a != b);
        prop_assert_ne!(
            PayloadHash::of_request("PATCH", "/sets/1", Some(&json!({"reps": a}))),
            PayloadHash::of_request("PATCH", "/sets/1", Some(&json!({"reps": b})))
        );
    }
}
