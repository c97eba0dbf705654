use futures::StreamExt;
use presley::adapters::amqp::attempts_of;
use presley::adapters::{AmqpTransport, PgStore};
use presley::application::handler::Routing;
use presley::application::{ConversionHandler, ErrorReporter, FfmpegTranscoder, RetryPolicy, WorkerPool};
use presley::config::Config;
use presley::ports::queue::InboundMessage;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Consumer tag identifying this worker on the broker.
const CONSUMER_TAG: &str = "presley";

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = PgStore::connect(&config.postgres_url())
        .await
        .expect("Failed to connect to PostgreSQL");
    info!("Connected to PostgreSQL successfully");

    let transport = AmqpTransport::connect(&config.rabbitmq_url, &config.conversion_exchange)
        .await
        .expect("Failed to connect to RabbitMQ");
    info!("Connected to RabbitMQ successfully");

    let mut consumer = transport
        .consume(&config.conversion_key, &config.conversion_queue, CONSUMER_TAG)
        .await
        .expect("Failed to consume messages");

    let handler = Arc::new(ConversionHandler::new(
        transport.clone(),
        store.clone(),
        ErrorReporter::new(store),
        FfmpegTranscoder,
        Routing::from_config(&config),
        RetryPolicy::new(config.max_attempts),
    ));

    let pool = WorkerPool::new(handler, config.worker_count);
    let (backlog, _workers) = pool.start();

    let consume_task = tokio::spawn(async move {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let attempts = attempts_of(&delivery);
                    let message = InboundMessage {
                        delivery_tag: delivery.delivery_tag,
                        attempts,
                        body: delivery.data,
                    };
                    if backlog.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!(error = %err, "failed to consume message"),
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");

    consume_task.abort();
    if let Err(err) = transport.close().await {
        error!(error = %err, "failed to close broker connection");
    }
}
