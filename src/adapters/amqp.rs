//! Lapin-backed AMQP transport.
//!
//! Owns the broker connection and one channel shared by every worker
//! task. Exchange and queues are declared direct, durable and
//! auto-delete, and bound on every consume/publish so either side can
//! start first.

use crate::ports::queue::JobTransport;
use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::error::Error;
use std::sync::Arc;

/// Message header carrying the retry attempt count.
pub const ATTEMPTS_HEADER: &str = "x-attempts";

#[derive(Clone)]
pub struct AmqpTransport {
    connection: Arc<Connection>,
    channel: Channel,
    exchange: String,
}

impl AmqpTransport {
    /// Connect to the broker and open the shared channel.
    pub async fn connect(url: &str, exchange: &str) -> Result<Self, lapin::Error> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        Ok(Self {
            connection: Arc::new(connection),
            channel,
            exchange: exchange.to_owned(),
        })
    }

    /// Start consuming `queue` bound to the exchange under
    /// `routing_key`.
    pub async fn consume(
        &self,
        routing_key: &str,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Consumer, lapin::Error> {
        self.declare_and_bind(routing_key, queue).await?;
        self.channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
    }

    pub async fn close(&self) -> Result<(), lapin::Error> {
        self.connection.close(200, "shutting down").await
    }

    async fn declare_and_bind(&self, routing_key: &str, queue: &str) -> Result<(), lapin::Error> {
        self.channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                queue,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish_with_properties(
        &self,
        routing_key: &str,
        queue: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), lapin::Error> {
        self.declare_and_bind(routing_key, queue).await?;
        self.channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobTransport for AmqpTransport {
    async fn ack(&self, delivery_tag: u64) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        queue: &str,
        body: &[u8],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let properties =
            BasicProperties::default().with_content_type(ShortString::from("application/json"));
        self.publish_with_properties(routing_key, queue, body, properties)
            .await?;
        Ok(())
    }

    async fn publish_retry(
        &self,
        routing_key: &str,
        queue: &str,
        body: &[u8],
        attempts: u32,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(ATTEMPTS_HEADER),
            AMQPValue::LongUInt(attempts),
        );
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_headers(headers);
        self.publish_with_properties(routing_key, queue, body, properties)
            .await?;
        Ok(())
    }
}

/// Retry attempt count carried in the delivery headers, 0 when absent.
pub fn attempts_of(delivery: &Delivery) -> u32 {
    delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(ATTEMPTS_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0)
}
