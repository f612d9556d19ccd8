//! # mq-connector
//! Connector layer attaching services to a RabbitMQ cluster: named consumer
//! workers with their own connections and receive loops, correlation-id
//! publishing, credential resolution from deployed config, and a generic
//! retry driver with exponential backoff.

pub mod config;
pub mod connection;
pub mod connector;
pub mod consumer;
pub mod errors;
pub mod message;
pub mod retry;

// Re-export key components for easy access
pub use config::{MqConfig, MqCredentialsEntry};
pub use connection::{ConnectionOptions, ConnectionParams, Credentials};
pub use connector::{MqConnector, MqService};
pub use consumer::{ConsumerCallback, ConsumerErrorHandler, ConsumerWorker, LogErrorHandler};
pub use errors::{ConnectorError, Result};
pub use message::{create_unique_id, MESSAGE_ID_KEY};
pub use retry::{backoff_delay, run_with_retry, run_with_retry_hooks, RetryPolicy};
