use std::sync::Arc;
use std::net::SocketAddr;
use anyhow::Context;
use herd_api::{app, metrics::Metrics, state::{AppState, AuthConfig, InternalAuth}, worker};
use herd_booking::BookingOrchestrator;
use herd_store::{Config, DbClient, EventProducer, GatewayRegistry, KafkaNotificationSink, PgStore, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herd_api=debug,herd_booking=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting HERD payments API on port {}", config.server.port);

    // Postgres ledger
    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(PgStore::new(db.pool.clone()));

    // Payment gateway
    let gateways = GatewayRegistry::new(&config.stripe, &[]).context("Failed to build gateway client")?;
    let gateway = gateways.default_client().context("No default gateway client")?;

    // Kafka notification outbox
    let producer = EventProducer::new(&config.kafka.brokers).context("Failed to create Kafka producer")?;
    let notifier = Arc::new(KafkaNotificationSink::new(producer, config.kafka.notification_topic.clone()));

    // Redis is optional; without it requests are not rate limited
    let redis = match &config.redis {
        Some(redis) => match RedisClient::new(&redis.url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!("Redis unavailable, rate limiting disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let orchestrator = BookingOrchestrator::new(
        store.clone(),
        store.clone(),
        store,
        gateway,
        notifier,
        Arc::new(config.payments.clone()),
    );

    if config.scheduler.enabled {
        tokio::spawn(worker::start_sweep_scheduler(
            orchestrator.clone(),
            config.scheduler.interval_seconds,
        ));
    }

    let app_state = AppState {
        orchestrator,
        redis,
        metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        internal: InternalAuth {
            cron_secret: config.internal.cron_secret.clone(),
            service_role_key: config.internal.service_role_key.clone(),
        },
        webhook_secret: config.stripe.webhook_secret.clone(),
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>()
    ).await?;

    Ok(())
}
