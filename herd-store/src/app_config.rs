use serde::Deserialize;
use std::env;
use herd_core::PaymentRules;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    pub internal: InternalConfig,
    pub stripe: StripeConfig,
    pub payments: PaymentRules,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
}

fn default_notification_topic() -> String {
    "herd.notifications".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

/// Credentials for scheduler and service-to-service calls
#[derive(Debug, Deserialize, Clone)]
pub struct InternalConfig {
    pub cron_secret: String,
    pub service_role_key: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_version() -> String {
    "2024-06-20".to_string()
}

fn default_api_base() -> String {
    "https://api.stripe.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    300
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { enabled: false, interval_seconds: default_interval_seconds() }
    }
}

/// Startup refuses to continue past any of these
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `HERD__STRIPE__SECRET_KEY=sk_live_...`
            .add_source(config::Environment::with_prefix("HERD").separator("__"))
            .build()?;

        let cfg: Config = s.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("stripe.secret_key", &self.stripe.secret_key),
            ("stripe.webhook_secret", &self.stripe.webhook_secret),
            ("database.url", &self.database.url),
            ("auth.jwt_secret", &self.auth.jwt_secret),
            ("internal.cron_secret", &self.internal.cron_secret),
            ("internal.service_role_key", &self.internal.service_role_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} must be set", name)));
            }
        }
        self.payments.validate().map_err(ConfigError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig { port: 3000 },
            database: DatabaseConfig { url: "postgres://localhost/herd".to_string(), max_connections: 5 },
            redis: None,
            kafka: KafkaConfig { brokers: "localhost:9092".to_string(), notification_topic: default_notification_topic() },
            auth: AuthConfig { jwt_secret: "jwt".to_string() },
            internal: InternalConfig { cron_secret: "cron".to_string(), service_role_key: "svc".to_string() },
            stripe: StripeConfig {
                secret_key: "sk_test_123".to_string(),
                webhook_secret: "whsec_123".to_string(),
                api_version: default_api_version(),
                api_base: default_api_base(),
            },
            payments: PaymentRules::with_app_url("https://herd.test"),
            scheduler: SchedulerConfig::default(),
        }
    }

    #[test]
    fn test_complete_config_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_missing_gateway_secret_is_fatal() {
        let mut cfg = sample();
        cfg.stripe.secret_key = "  ".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stripe.secret_key"));
    }

    #[test]
    fn test_bad_fee_rate_is_fatal() {
        let mut cfg = sample();
        cfg.payments.platform_fee_rate = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
