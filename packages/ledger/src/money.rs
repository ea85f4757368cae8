//! Money Math
//!
//! Pure integer arithmetic over minor units. The commission ceiling is a
//! system invariant: rounding down would leak value out of the closed
//! system one sub-cent at a time.

use sha2::{Digest, Sha256};

/// Commission rate: 1.5%, expressed as 3/200 so everything stays integral.
pub const COMMISSION_NUMERATOR: i64 = 3;
pub const COMMISSION_DENOMINATOR: i64 = 200;

/// Fee charged to the sender: `ceil(amount * 3 / 200)`.
///
/// Computed in 128-bit so no valid `i64` amount can overflow.
pub fn commission(amount: i64) -> i64 {
    let num = amount as i128 * COMMISSION_NUMERATOR as i128;
    let den = COMMISSION_DENOMINATOR as i128;
    ((num + den - 1) / den) as i64
}

/// What leaves the sender's balance: `amount + commission(amount)`.
pub fn total_debited(amount: i64) -> i64 {
    amount.saturating_add(commission(amount))
}

/// Fallback idempotency key for callers that omit the header:
/// `sha256(sender_id | receiver_id | amount | timestamp)`, hex-encoded.
///
/// Callers are encouraged to supply their own key so that a client-side
/// retry of the same logical request collapses across clock drift.
pub fn derive_idempotency_key(
    sender_id: i64,
    receiver_id: i64,
    amount: i64,
    timestamp: i64,
) -> String {
    let material = format!("{sender_id}|{receiver_id}|{amount}|{timestamp}");
    hex::encode(Sha256::digest(material.as_bytes()))
}

/// Render minor units as a dollar string, e.g. `10150` -> `"101.50"`.
pub fn format_dollars(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commission_rounds_up() {
        // ceil(1 * 3 / 200) = ceil(0.015) = 1
        assert_eq!(commission(1), 1);
        assert_eq!(commission(100), 2);
        assert_eq!(commission(10_000), 150);
    }

    #[test]
    fn test_commission_boundary_pair() {
        // 6666 * 3 = 19998 -> ceil(99.99) = 100; one cent more tips over
        assert_eq!(commission(6_666), 100);
        assert_eq!(commission(6_667), 101);
    }

    #[test]
    fn test_commission_exact_multiple() {
        // 200 * 3 / 200 is exact, no rounding
        assert_eq!(commission(200), 3);
        assert_eq!(commission(20_000), 300);
    }

    #[test]
    fn test_total_debited() {
        assert_eq!(total_debited(10_000), 10_150);
        assert_eq!(total_debited(333), 338);
    }

    #[test]
    fn test_commission_large_amount_does_not_overflow() {
        let amount = i64::MAX;
        assert!(commission(amount) > 0);
    }

    #[test]
    fn test_derive_idempotency_key_is_deterministic() {
        let a = derive_idempotency_key(1, 2, 10_000, 1_700_000_000);
        let b = derive_idempotency_key(1, 2, 10_000, 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = derive_idempotency_key(1, 2, 10_000, 1_700_000_001);
        assert_ne!(a, c);
    }

    #[test]
    fn test_format_dollars() {
        assert_eq!(format_dollars(10_150), "101.50");
        assert_eq!(format_dollars(5), "0.05");
        assert_eq!(format_dollars(0), "0.00");
        assert_eq!(format_dollars(-333), "-3.33");
    }
}
