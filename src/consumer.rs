// src/consumer.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, Error as LapinError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionParams;
use crate::errors::{ConnectorError, Result};

/// Maximum number of unacknowledged messages a worker holds in flight.
pub const PREFETCH_COUNT: u16 = 50;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Logic applied to every delivered message.
///
/// The delivery is handed over whole, acker included. When the worker runs
/// with manual ack mode, acknowledging is entirely the callback's job; the
/// worker never acks on its behalf.
#[async_trait]
pub trait ConsumerCallback: Send + Sync {
    async fn on_message(&self, channel: &Channel, delivery: Delivery) -> Result<()>;
}

/// Receives failures raised inside a worker's receive loop.
///
/// Errors never propagate out of the worker's task; this handler is the only
/// place they surface. A service that needs to react to a dead consumer
/// installs its own handler here.
#[async_trait]
pub trait ConsumerErrorHandler: Send + Sync {
    async fn on_error(&self, consumer: &str, error: &ConnectorError);
}

#[async_trait]
impl<F> ConsumerErrorHandler for F
where
    F: Fn(&str, &ConnectorError) + Send + Sync,
{
    async fn on_error(&self, consumer: &str, error: &ConnectorError) {
        self(consumer, error)
    }
}

/// Default error handler: records the failure and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorHandler;

#[async_trait]
impl ConsumerErrorHandler for LogErrorHandler {
    async fn on_error(&self, consumer: &str, error: &ConnectorError) {
        error!(consumer, %error, "error occurred in consumer");
    }
}

/// One subscription: its own connection, channel and receive-loop task.
///
/// Workers never share broker resources with each other; every registration
/// pays its own connection setup. Lifecycle: [`open`](Self::open) creates the
/// subscription, [`start`](Self::start) spawns the receive loop,
/// [`stop`](Self::stop) cancels consumption, tears the resources down and
/// joins the task.
pub struct ConsumerWorker {
    name: String,
    queue: String,
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    consumer_tag: String,
    callback: Arc<dyn ConsumerCallback>,
    error_handler: Arc<dyn ConsumerErrorHandler>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerWorker {
    /// Opens the subscription: connect, channel, prefetch, queue declare,
    /// consume registration. The receive loop does not run until `start`.
    ///
    /// The queue is declared durable and never auto-deleted. If any setup
    /// step after the connect fails, the connection is closed before the
    /// error is returned so no half-open worker is left behind.
    pub async fn open(
        params: &ConnectionParams,
        properties: ConnectionProperties,
        name: impl Into<String>,
        queue: impl Into<String>,
        callback: Arc<dyn ConsumerCallback>,
        error_handler: Arc<dyn ConsumerErrorHandler>,
        auto_ack: bool,
    ) -> Result<Self> {
        let name = name.into();
        let queue = queue.into();

        let connection = Connection::connect_uri(params.amqp_uri(), properties).await?;

        let (channel, consumer, consumer_tag) =
            match Self::setup_channel(&connection, &queue, auto_ack).await {
                Ok(parts) => parts,
                Err(err) => {
                    if let Err(close_err) = connection.close(0, "Consumer setup failed").await {
                        warn!(
                            consumer = %name,
                            error = %close_err,
                            "failed to close connection after setup failure"
                        );
                    }
                    return Err(err);
                }
            };

        info!(consumer = %name, queue = %queue, %consumer_tag, "consumer registered");

        Ok(Self {
            name,
            queue,
            connection,
            channel,
            consumer: Some(consumer),
            consumer_tag,
            callback,
            error_handler,
            task: None,
        })
    }

    async fn setup_channel(
        connection: &Connection,
        queue: &str,
        auto_ack: bool,
    ) -> Result<(Channel, Consumer, String)> {
        let channel = connection.create_channel().await?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let consumer_tag = format!("consumer-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok((channel, consumer, consumer_tag))
    }

    /// Spawns the receive loop. Starting an already-started worker logs a
    /// warning and does nothing; a stop/start cycle is not supported, open
    /// a fresh worker instead.
    pub fn start(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            warn!(consumer = %self.name, "consumer already started, ignoring");
            return;
        };

        let name = self.name.clone();
        let channel = self.channel.clone();
        let callback = self.callback.clone();
        let error_handler = self.error_handler.clone();

        self.task = Some(tokio::spawn(receive_loop(
            name,
            channel,
            consumer,
            callback,
            error_handler,
        )));
    }

    /// Requests shutdown and waits for the receive loop to finish.
    ///
    /// Cancels consumption, closes the channel if open, closes the
    /// connection if open (a failure in any step is logged and the next
    /// step still runs), then joins the task. The join is bounded: a loop
    /// that fails to wind down within 5 seconds is aborted and reported as
    /// a `ConsumerRuntime` error. Safe to call on a worker that never
    /// started or whose resources are already closed.
    pub async fn stop(&mut self) -> Result<()> {
        if let Err(err) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(consumer = %self.name, error = %err, "failed to cancel consumption");
        }

        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(0, "Closing consumer").await {
                warn!(consumer = %self.name, error = %err, "failed to close channel");
            }
        }

        if self.connection.status().connected() {
            if let Err(err) = self.connection.close(0, "Closing consumer").await {
                warn!(consumer = %self.name, error = %err, "failed to close connection");
            }
        }

        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            debug!(consumer = %self.name, "consumer was never started, nothing to join");
            return Ok(());
        };

        match tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {
                info!(consumer = %self.name, "consumer stopped");
                Ok(())
            }
            Ok(Err(join_err)) => Err(ConnectorError::ConsumerRuntime(format!(
                "receive loop for '{}' terminated abnormally: {join_err}",
                self.name
            ))),
            Err(_) => {
                task.abort();
                Err(ConnectorError::ConsumerRuntime(format!(
                    "receive loop for '{}' did not stop within {STOP_JOIN_TIMEOUT:?}, aborted",
                    self.name
                )))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True while the receive-loop task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

async fn receive_loop(
    name: String,
    channel: Channel,
    mut consumer: Consumer,
    callback: Arc<dyn ConsumerCallback>,
    error_handler: Arc<dyn ConsumerErrorHandler>,
) {
    info!(consumer = %name, "receive loop started");

    while let Some(delivery_result) = consumer.next().await {
        match delivery_result {
            Ok(delivery) => {
                if let Err(err) = callback.on_message(&channel, delivery).await {
                    error!(consumer = %name, error = %err, "message callback failed");
                    error_handler.on_error(&name, &err).await;
                    break;
                }
            }
            Err(err) if is_closed_by_broker(&err) => {
                debug!(consumer = %name, "channel closed by broker");
                break;
            }
            Err(err) => {
                let err = ConnectorError::from(err);
                error!(consumer = %name, error = %err, "receive loop failed");
                error_handler.on_error(&name, &err).await;
                break;
            }
        }
    }

    debug!(consumer = %name, "receive loop finished");
}

// Closed channel/connection states signal planned shutdown, not failure.
fn is_closed_by_broker(error: &LapinError) -> bool {
    matches!(
        error,
        LapinError::InvalidChannelState(_) | LapinError::InvalidConnectionState(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{ChannelState, ConnectionState};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn closed_states_count_as_planned_shutdown() {
        assert!(is_closed_by_broker(&LapinError::InvalidChannelState(
            ChannelState::Closed
        )));
        assert!(is_closed_by_broker(&LapinError::InvalidConnectionState(
            ConnectionState::Closed
        )));
        assert!(!is_closed_by_broker(&LapinError::ChannelsLimitReached));
    }

    #[tokio::test]
    async fn closures_work_as_error_handlers() {
        let fired = Arc::new(AtomicBool::new(false));
        let observed = fired.clone();

        let handler: Arc<dyn ConsumerErrorHandler> =
            Arc::new(move |consumer: &str, _error: &ConnectorError| {
                assert_eq!(consumer, "events");
                observed.store(true, Ordering::SeqCst);
            });

        let err = ConnectorError::ConsumerRuntime("boom".to_string());
        handler.on_error("events", &err).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn log_handler_does_not_panic() {
        let err = ConnectorError::ConsumerRuntime("boom".to_string());
        LogErrorHandler.on_error("events", &err).await;
    }
}
