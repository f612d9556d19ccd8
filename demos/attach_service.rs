// demos/attach_service.rs
//
// Attaches a demo service to a local broker, consumes its queue, publishes
// one message to it and shuts down on ctrl-c:
//
//   cargo run --example attach_service
//
// Needs RabbitMQ on localhost:5672 with the default guest account.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::BasicAckOptions;
use lapin::Channel;
use serde_json::json;
use tracing::{error, info, warn};

use mq_connector::message::decode_payload;
use mq_connector::{
    run_with_retry_hooks, ConnectionOptions, ConsumerCallback, MqConfig, MqConnector, MqService,
    Result, RetryPolicy,
};

struct DemoService {
    connector: MqConnector,
}

impl MqService for DemoService {
    fn attach(config: Option<MqConfig>, service_name: &str) -> Result<Self> {
        Ok(Self {
            connector: MqConnector::new(config, service_name)?,
        })
    }

    fn connector(&self) -> &MqConnector {
        &self.connector
    }

    fn connector_mut(&mut self) -> &mut MqConnector {
        &mut self.connector
    }
}

struct PrintCallback;

#[async_trait]
impl ConsumerCallback for PrintCallback {
    async fn on_message(&self, _channel: &Channel, delivery: Delivery) -> Result<()> {
        let payload = decode_payload(&delivery.data)?;
        info!(%payload, "received message");
        delivery.ack(BasicAckOptions::default()).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    let config = MqConfig::from_value(json!({
        "server": "localhost",
        "port": 5672,
        "users": {"demo": {"user": "guest", "password": "guest"}}
    }))?;

    let mut service = DemoService::attach(Some(config), "demo")?;
    service
        .connector_mut()
        .register_consumer(
            "demo_consumer",
            "/",
            "demo_queue",
            Arc::new(PrintCallback),
            None,
            false,
        )
        .await?;
    service.connector_mut().run();

    // A broker that is still starting up gets a couple of extra chances.
    let policy = RetryPolicy::new().with_max_retries(2).with_backoff_factor(0.5);
    let connector = service.connector();
    let connection = run_with_retry_hooks(
        policy,
        || connector.create_mq_connection("/", ConnectionOptions::default()),
        |err, attempt| warn!(attempt, %err, "connect attempt failed"),
        |attempts| error!(attempts, "broker unreachable, giving up"),
    )
    .await?;
    let message_id =
        MqConnector::emit_mq_message(&connection, "demo_queue", json!({"data": "Hello!"}), None)
            .await?;
    connection.close(0, "Closing publisher").await?;
    info!(%message_id, "published, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    if let Err(err) = service.connector_mut().stop().await {
        error!(%err, "shutdown incomplete");
    }
    Ok(())
}
