use serde::{Deserialize, Serialize};
use crate::booking::ClassListing;

/// Revenue split of a charged total. Derived, never entered by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub total: i64,
    pub platform_fee: i64,
    pub host_payout: i64,
}

impl FeeSplit {
    /// For a total `T` that already includes a fee at rate `r`:
    /// host portion = T / (1 + r), platform fee = round(portion * r),
    /// host payout = round(portion).
    pub fn from_total(total: i64, fee_rate: f64) -> Self {
        let host_portion = total as f64 / (1.0 + fee_rate);
        Self {
            total,
            platform_fee: (host_portion * fee_rate).round() as i64,
            host_payout: host_portion.round() as i64,
        }
    }

    /// Cents lost or gained by rounding the two halves independently
    pub fn rounding_remainder(&self) -> i64 {
        self.total - self.platform_fee - self.host_payout
    }
}

/// Base price of a class in minor units. Minor-unit listings win; a
/// major-unit price is scaled by 100.
pub fn base_price_cents(class: &ClassListing) -> Option<i64> {
    match (class.price_cents, class.price) {
        (Some(cents), _) => Some(cents),
        (None, Some(major)) if major.is_finite() => Some((major * 100.0).round() as i64),
        _ => None,
    }
}

/// Guest-facing price of one seat, platform fee included
pub fn per_seat_price(base_cents: i64, fee_rate: f64) -> i64 {
    (base_cents as f64 * (1.0 + fee_rate)).round() as i64
}

/// Rough processor fee, kept for host reporting only
pub fn gateway_fee_estimate(total: i64, percent: f64, fixed_cents: i64) -> i64 {
    (total as f64 * percent).round() as i64 + fixed_cents
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_split_of_115_dollars() {
        let split = FeeSplit::from_total(11500, 0.15);
        assert_eq!(split.host_payout, 10000);
        assert_eq!(split.platform_fee, 1500);
        assert_eq!(split.rounding_remainder(), 0);
    }

    #[test]
    fn test_split_rounding_stays_within_a_cent() {
        for total in [1, 99, 1001, 2345, 99999, 123457] {
            let split = FeeSplit::from_total(total, 0.15);
            assert!(split.rounding_remainder().abs() <= 1, "total {}", total);
        }
    }

    #[test]
    fn test_per_seat_price_includes_fee() {
        assert_eq!(per_seat_price(10000, 0.15), 11500);
        assert_eq!(per_seat_price(2000, 0.15), 2300);
    }

    #[test]
    fn test_base_price_coercion() {
        let mut class = ClassListing {
            id: Uuid::new_v4(),
            host_id: Uuid::new_v4(),
            title: "Knife skills".to_string(),
            price_cents: None,
            price: Some(45.5),
            capacity: 10,
            auto_approve: false,
            start_date: Utc::now(),
            end_date: None,
            duration_minutes: Some(60),
        };
        assert_eq!(base_price_cents(&class), Some(4550));

        class.price_cents = Some(4000);
        assert_eq!(base_price_cents(&class), Some(4000));

        class.price_cents = None;
        class.price = None;
        assert_eq!(base_price_cents(&class), None);
    }

    #[test]
    fn test_gateway_fee_estimate() {
        assert_eq!(gateway_fee_estimate(10000, 0.029, 30), 320);
    }
}
