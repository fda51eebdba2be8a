use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error};
use herd_core::{Notification, NotificationSink, NotifyError};

/// Outbox producer. Delivery is acknowledged by the broker before `publish` returns.
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self { producer, queue_timeout: Duration::from_secs(1) })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(self.queue_timeout)).await {
            Ok(delivery) => {
                debug!(topic, key, partition = delivery.partition, offset = delivery.offset, "Job published");
                Ok(())
            }
            Err((e, _msg)) => {
                error!(topic, key, "Failed to publish job: {}", e);
                Err(e)
            }
        }
    }
}

/// Email job outbox on a Kafka topic, partitioned by recipient
#[derive(Clone)]
pub struct KafkaNotificationSink {
    producer: EventProducer,
    topic: String,
}

impl KafkaNotificationSink {
    pub fn new(producer: EventProducer, topic: impl Into<String>) -> Self {
        Self { producer, topic: topic.into() }
    }
}

/// JSON body of one email job, `type`-tagged
pub fn encode_job(job: &Notification) -> Result<String, NotifyError> {
    serde_json::to_string(job).map_err(|e| NotifyError(e.to_string()))
}

/// Hands the job to a background task and returns once it is encoded.
/// Broker acks never hold up the request that produced the job; delivery
/// failures are logged by `publish`.
#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    async fn submit(&self, job: Notification) -> Result<(), NotifyError> {
        let payload = encode_job(&job)?;
        let key = job.recipient().to_string();
        let producer = self.producer.clone();
        let topic = self.topic.clone();

        tokio::spawn(async move {
            let _ = producer.publish(&topic, &key, &payload).await;
        });
        Ok(())
    }
}
