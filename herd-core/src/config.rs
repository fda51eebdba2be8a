use serde::Deserialize;

/// Money and timing rules shared by every lifecycle operation.
/// Built once at startup and handed to the orchestrator.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PaymentRules {
    #[serde(default = "default_fee_rate")]
    pub platform_fee_rate: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_hold_minutes")]
    pub hold_minutes: i64,
    #[serde(default = "default_payout_buffer_hours")]
    pub payout_buffer_hours: i64,
    #[serde(default = "default_review_unlock_hours")]
    pub review_unlock_hours: i64,
    #[serde(default = "default_sweep_batch_limit")]
    pub sweep_batch_limit: i64,
    #[serde(default = "default_max_sweep_limit")]
    pub max_sweep_limit: i64,
    #[serde(default = "default_stalled_capture_minutes")]
    pub stalled_capture_minutes: i64,
    #[serde(default = "default_gateway_fee_percent")]
    pub gateway_fee_percent: f64,
    #[serde(default = "default_gateway_fee_fixed_cents")]
    pub gateway_fee_fixed_cents: i64,
    /// Front-end origin used for checkout and onboarding redirects
    pub app_url: String,
}

fn default_fee_rate() -> f64 {
    0.15
}

fn default_currency() -> String {
    "usd".to_string()
}

fn default_hold_minutes() -> i64 {
    30
}

fn default_payout_buffer_hours() -> i64 {
    24
}

fn default_review_unlock_hours() -> i64 {
    2
}

fn default_sweep_batch_limit() -> i64 {
    100
}

fn default_max_sweep_limit() -> i64 {
    500
}

fn default_stalled_capture_minutes() -> i64 {
    15
}

fn default_gateway_fee_percent() -> f64 {
    0.029
}

fn default_gateway_fee_fixed_cents() -> i64 {
    30
}

impl PaymentRules {
    pub fn with_app_url(app_url: impl Into<String>) -> Self {
        Self {
            platform_fee_rate: default_fee_rate(),
            currency: default_currency(),
            hold_minutes: default_hold_minutes(),
            payout_buffer_hours: default_payout_buffer_hours(),
            review_unlock_hours: default_review_unlock_hours(),
            sweep_batch_limit: default_sweep_batch_limit(),
            max_sweep_limit: default_max_sweep_limit(),
            stalled_capture_minutes: default_stalled_capture_minutes(),
            gateway_fee_percent: default_gateway_fee_percent(),
            gateway_fee_fixed_cents: default_gateway_fee_fixed_cents(),
            app_url: app_url.into(),
        }
    }

    /// Clamp a caller-supplied sweep limit into `1..=max_sweep_limit`
    pub fn sweep_limit(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.sweep_batch_limit)
            .clamp(1, self.max_sweep_limit.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..1.0).contains(&self.platform_fee_rate) {
            return Err(format!("platform_fee_rate must be in [0, 1), got {}", self.platform_fee_rate));
        }
        if self.currency.trim().is_empty() {
            return Err("currency must not be empty".to_string());
        }
        if self.payout_buffer_hours < 0 || self.review_unlock_hours < 0 {
            return Err("payout_buffer_hours and review_unlock_hours must not be negative".to_string());
        }
        if self.hold_minutes <= 0 {
            return Err("hold_minutes must be positive".to_string());
        }
        if self.app_url.trim().is_empty() {
            return Err("app_url must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_limit_is_clamped() {
        let rules = PaymentRules::with_app_url("https://herd.test");
        assert_eq!(rules.sweep_limit(None), 100);
        assert_eq!(rules.sweep_limit(Some(0)), 1);
        assert_eq!(rules.sweep_limit(Some(10_000)), 500);
    }

    #[test]
    fn test_fee_rate_bounds() {
        let mut rules = PaymentRules::with_app_url("https://herd.test");
        assert!(rules.validate().is_ok());
        rules.platform_fee_rate = 1.5;
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_omitted_fields_take_defaults() {
        let rules: PaymentRules =
            serde_json::from_value(serde_json::json!({ "app_url": "https://herd.test" })).unwrap();
        assert_eq!(rules, PaymentRules::with_app_url("https://herd.test"));
        assert_eq!(rules.currency, "usd");
        assert_eq!(rules.gateway_fee_fixed_cents, 30);
    }
}
