pub mod app_config;
pub mod database;
pub mod booking_repo;
pub mod stripe;
pub mod events;
pub mod redis_repo;

pub use app_config::Config;
pub use database::DbClient;
pub use booking_repo::PgStore;
pub use stripe::{GatewayRegistry, StripeGateway};
pub use events::{EventProducer, KafkaNotificationSink};
pub use redis_repo::RedisClient;
