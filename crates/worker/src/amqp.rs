// AMQP broker binding
// Decision: One connection per process, one channel and basic_consume per worker
// Decision: Topology (exchange, queue, binding) is declared once at connect time
// Decision: A broker-side stream error ends that worker's stream; the worker then reports completion

use async_trait::async_trait;
use futures::{future, StreamExt};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, error, info};

use staterelay_core::consumer::{Consumer, ConsumerError, Intake, Subscription};
use staterelay_core::delivery::{AckError, Acknowledge, Delivery};
use staterelay_core::STATE_BINDING_KEY;

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;

/// Exchange, queue and consumption settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    /// Topic exchange state events are published to
    pub exchange: String,

    /// Queue shared by all workers
    pub queue: String,

    /// Binding key between exchange and queue
    pub binding_key: String,

    /// How long the broker retains undelivered messages, in milliseconds
    pub message_ttl_ms: i32,

    /// Whether the queue survives a broker restart
    pub durable_queue: bool,

    /// Unacknowledged deliveries per worker channel
    pub prefetch: u16,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            exchange: "amq.topic".to_string(),
            queue: "stateservice".to_string(),
            binding_key: STATE_BINDING_KEY.to_string(),
            message_ttl_ms: 600_000,
            durable_queue: false,
            prefetch: 16,
        }
    }
}

impl AmqpSettings {
    /// Set the per-worker prefetch
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Arguments for the queue declaration
    pub fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongInt(self.message_ttl_ms),
        );
        arguments
    }
}

/// Broker consumer backed by a single AMQP connection
pub struct AmqpConsumer {
    connection: Connection,
    settings: AmqpSettings,
}

impl AmqpConsumer {
    /// Connect to the broker and declare the exchange, queue and binding
    pub async fn connect(uri: &str, settings: AmqpSettings) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;

        let channel = connection.create_channel().await?;
        declare_topology(&channel, &settings).await?;
        channel.close(REPLY_SUCCESS, "topology declared").await?;

        info!(
            exchange = %settings.exchange,
            queue = %settings.queue,
            binding_key = %settings.binding_key,
            "Connected to broker"
        );

        Ok(Self {
            connection,
            settings,
        })
    }

    /// Close the connection once every worker has drained
    pub async fn close(&self) -> Result<(), lapin::Error> {
        self.connection.close(REPLY_SUCCESS, "shutdown").await
    }
}

async fn declare_topology(channel: &Channel, settings: &AmqpSettings) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            &settings.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_declare(
            &settings.queue,
            QueueDeclareOptions {
                durable: settings.durable_queue,
                ..Default::default()
            },
            settings.queue_arguments(),
        )
        .await?;

    channel
        .queue_bind(
            &settings.queue,
            &settings.exchange,
            &settings.binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    Ok(())
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, ConsumerError> {
        let subscribe_error = |e: lapin::Error| ConsumerError::Subscribe {
            consumer_tag: consumer_tag.to_string(),
            source: Box::new(e),
        };

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(subscribe_error)?;

        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(subscribe_error)?;

        let consumer = channel
            .basic_consume(
                &self.settings.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(subscribe_error)?;

        debug!(consumer_tag, channel_id = channel.id(), "Subscribed");

        let tag = consumer_tag.to_string();
        let deliveries = consumer
            .take_while(move |item| {
                if let Err(e) = item {
                    error!(consumer_tag = %tag, error = %e, "Delivery stream failed");
                }
                future::ready(item.is_ok())
            })
            .filter_map(|item| future::ready(item.ok().map(into_delivery)))
            .boxed();

        Ok(Subscription {
            consumer_tag: consumer_tag.to_string(),
            deliveries,
            intake: Box::new(AmqpIntake {
                channel,
                consumer_tag: consumer_tag.to_string(),
            }),
        })
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.routing_key.as_str(),
        delivery.data,
        delivery.delivery_tag,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|e| AckError {
                delivery_tag,
                source: Box::new(e),
            })
    }
}

struct AmqpIntake {
    channel: Channel,
    consumer_tag: String,
}

#[async_trait]
impl Intake for AmqpIntake {
    async fn cancel(&mut self) -> Result<(), ConsumerError> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| ConsumerError::Cancel {
                consumer_tag: self.consumer_tag.clone(),
                source: Box::new(e),
            })
    }

    async fn close(&mut self) -> Result<(), ConsumerError> {
        self.channel
            .close(REPLY_SUCCESS, "drained")
            .await
            .map_err(|e| ConsumerError::Close {
                consumer_tag: self.consumer_tag.clone(),
                source: Box::new(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AmqpSettings::default();

        assert_eq!(settings.exchange, "amq.topic");
        assert_eq!(settings.queue, "stateservice");
        assert_eq!(
            settings.binding_key,
            "*.$cloud.device.*.channel.*.event.state"
        );
        assert_eq!(settings.message_ttl_ms, 600_000);
        assert!(!settings.durable_queue);
    }

    #[test]
    fn test_queue_arguments_carry_ttl() {
        let arguments = AmqpSettings::default().queue_arguments();

        assert_eq!(
            arguments.inner().get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongInt(600_000))
        );
    }

    #[test]
    fn test_with_prefetch() {
        assert_eq!(AmqpSettings::default().with_prefetch(1).prefetch, 1);
    }
}
