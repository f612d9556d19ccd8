// src/connector.rs

use std::collections::HashMap;
use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::MqConfig;
use crate::connection::{
    connection_properties, ConnectionOptions, ConnectionParams, Credentials, DEFAULT_CREDENTIAL,
    DEFAULT_HOST, DEFAULT_PORT,
};
use crate::consumer::{ConsumerCallback, ConsumerErrorHandler, ConsumerWorker, LogErrorHandler};
use crate::errors::{ConnectorError, Result};
use crate::message;

/// Attachment contract for services living on the MQ cluster.
///
/// A concrete service wraps an [`MqConnector`] and supplies the attach
/// constructor; the accessors give shared tooling a uniform way to reach the
/// connector operations.
pub trait MqService: Sized {
    /// Builds the service, attaching it to the cluster under `service_name`.
    fn attach(config: Option<MqConfig>, service_name: &str) -> Result<Self>;

    fn connector(&self) -> &MqConnector;

    fn connector_mut(&mut self) -> &mut MqConnector;
}

/// Connects one named service to the MQ cluster.
///
/// Owns credential resolution, connection-parameter construction, publishing
/// and a registry of named [`ConsumerWorker`]s. The registry is only reachable
/// through `&mut self`, so concurrent control calls on one connector are
/// rejected at compile time rather than racing at runtime.
pub struct MqConnector {
    config: MqConfig,
    service_name: String,
    service_id: String,
    consumers: HashMap<String, ConsumerWorker>,
}

impl MqConnector {
    /// Attaches `service_name` using the given config, or the one resolved
    /// from the default locations when `config` is `None`.
    ///
    /// Every instance gets a fresh service id, never reused across
    /// instances, which tags its connections for tracing.
    pub fn new(config: Option<MqConfig>, service_name: impl Into<String>) -> Result<Self> {
        let config = match config {
            Some(config) => config,
            None => MqConfig::load_default()?,
        };
        let service_name = service_name.into();
        let service_id = message::create_unique_id();

        info!(service = %service_name, %service_id, "service attached");

        Ok(Self {
            config,
            service_name,
            service_id,
            consumers: HashMap::new(),
        })
    }

    /// Attaches from a raw JSON mapping; a non-empty top-level `"MQ"` key is
    /// unwrapped automatically.
    pub fn from_value(config: Value, service_name: impl Into<String>) -> Result<Self> {
        Self::new(Some(MqConfig::from_value(config)?), service_name)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Identity token unique to this connector instance.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn config(&self) -> &MqConfig {
        &self.config
    }

    /// Generates a unique id, shared by service ids and message ids.
    pub fn create_unique_id() -> String {
        message::create_unique_id()
    }

    /// Login pair for this service from the configured `users` table.
    /// Absent username/password fields fall back to "guest".
    pub fn mq_credentials(&self) -> Result<Credentials> {
        let entry = self
            .config
            .credentials_entry(&self.service_name)
            .ok_or_else(|| {
                ConnectorError::Configuration(format!(
                    "no credentials configured for service '{}'",
                    self.service_name
                ))
            })?;

        Ok(Credentials::new(
            entry.user.as_deref().unwrap_or(DEFAULT_CREDENTIAL),
            entry.password.as_deref().unwrap_or(DEFAULT_CREDENTIAL),
        ))
    }

    /// Parameters for a connection to `vhost`, built fresh on every call so
    /// config changes apply to the next attempt.
    pub fn connection_params(
        &self,
        vhost: &str,
        options: ConnectionOptions,
    ) -> Result<ConnectionParams> {
        Ok(ConnectionParams {
            host: self
                .config
                .server
                .clone()
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: self.config.port.unwrap_or(DEFAULT_PORT),
            vhost: vhost.to_string(),
            credentials: self.mq_credentials()?,
            options,
        })
    }

    /// Opens a broker connection on the given virtual host. Awaits for the
    /// duration of the transport handshake; unreachable broker or rejected
    /// credentials surface as a `Connection` error.
    pub async fn create_mq_connection(
        &self,
        vhost: &str,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        let params = self.connection_params(vhost, options)?;
        let connection =
            Connection::connect_uri(params.amqp_uri(), self.connection_properties()).await?;

        info!(service = %self.service_name, vhost, "MQ connection opened");
        Ok(connection)
    }

    fn connection_properties(&self) -> ConnectionProperties {
        connection_properties(&self.service_name, &self.service_id)
    }

    /// Publishes a payload to `queue` over the given connection and returns
    /// the generated message id.
    ///
    /// The payload must be a non-empty JSON object; anything else is a
    /// `Validation` error and the broker is never touched. A fresh id is
    /// stamped under the reserved `"message_id"` key before sending, so the
    /// receiver sees the same id this call returns. The message rides a
    /// transient channel, closed on success and failure alike, and carries a
    /// 1-second expiration.
    pub async fn emit_mq_message(
        connection: &Connection,
        queue: &str,
        mut payload: Value,
        exchange: Option<&str>,
    ) -> Result<String> {
        let message_id = message::stamp_message_id(&mut payload)?;
        let body = message::encode_payload(&payload)?;

        let properties = BasicProperties::default()
            .with_expiration("1000".into())
            .with_message_id(message_id.clone().into())
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        let channel = connection.create_channel().await?;
        if let Err(publish_err) =
            Self::confirm_publish(&channel, exchange.unwrap_or(""), queue, &body, properties).await
        {
            // a failed close must not mask the publish error
            if let Err(close_err) = channel.close(0, "Closing publisher").await {
                warn!(queue, error = %close_err, "failed to close publisher channel");
            }
            return Err(publish_err);
        }
        channel.close(0, "Closing publisher").await?;

        info!(queue, %message_id, "message published");
        Ok(message_id)
    }

    async fn confirm_publish(
        channel: &Channel,
        exchange: &str,
        queue: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        channel
            .basic_publish(exchange, queue, BasicPublishOptions::default(), body, properties)
            .await?
            .await?; // Wait for confirmation
        Ok(())
    }

    /// Registers a consumer for `queue` under a unique `name`, eagerly
    /// opening its connection and channel: registration, not `run`, pays
    /// the connection-setup cost. Deliveries go to `callback`; failures
    /// raised by the callback go to `on_error` (default: log-only).
    ///
    /// Re-registering an existing name stops the prior worker before
    /// replacing it, so no live worker is ever silently dropped.
    #[instrument(skip(self, callback, on_error))]
    pub async fn register_consumer(
        &mut self,
        name: &str,
        vhost: &str,
        queue: &str,
        callback: Arc<dyn ConsumerCallback>,
        on_error: Option<Arc<dyn ConsumerErrorHandler>>,
        auto_ack: bool,
    ) -> Result<()> {
        if let Some(mut previous) = self.consumers.remove(name) {
            warn!(consumer = name, "re-registering consumer, stopping previous worker");
            if let Err(err) = previous.stop().await {
                warn!(consumer = name, error = %err, "previous worker did not stop cleanly");
            }
        }

        let params = self.connection_params(vhost, ConnectionOptions::default())?;
        let error_handler = on_error.unwrap_or_else(|| Arc::new(LogErrorHandler));

        let worker = ConsumerWorker::open(
            &params,
            self.connection_properties(),
            name,
            queue,
            callback,
            error_handler,
            auto_ack,
        )
        .await?;

        self.consumers.insert(name.to_string(), worker);
        Ok(())
    }

    /// Starts the named workers' receive loops; an empty list starts every
    /// registered worker. Unknown names are skipped; a worker that is
    /// already running logs a warning and is left alone.
    pub fn run_consumers(&mut self, names: &[&str]) {
        for name in self.select_names(names) {
            match self.consumers.get_mut(&name) {
                Some(worker) => worker.start(),
                None => debug!(consumer = %name, "consumer is not registered, skipping"),
            }
        }
    }

    /// Stops the named workers (all when the list is empty), waiting for
    /// each receive loop to terminate. Every selected worker is attempted
    /// even after a failure; failures are re-raised together as a single
    /// `Shutdown` error. A no-op when nothing is registered or running.
    pub async fn stop_consumers(&mut self, names: &[&str]) -> Result<()> {
        let mut failures = Vec::new();

        for name in self.select_names(names) {
            if let Some(worker) = self.consumers.get_mut(&name) {
                if let Err(err) = worker.stop().await {
                    failures.push((name, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::Shutdown { failures })
        }
    }

    /// Starts every registered consumer.
    pub fn run(&mut self) {
        self.run_consumers(&[]);
    }

    /// Stops every registered consumer.
    pub async fn stop(&mut self) -> Result<()> {
        self.stop_consumers(&[]).await
    }

    /// Names currently present in the registry, running or not.
    pub fn consumer_names(&self) -> Vec<&str> {
        self.consumers.keys().map(String::as_str).collect()
    }

    pub fn consumer(&self, name: &str) -> Option<&ConsumerWorker> {
        self.consumers.get(name)
    }

    fn select_names(&self, names: &[&str]) -> Vec<String> {
        if names.is_empty() {
            self.consumers.keys().cloned().collect()
        } else {
            names.iter().map(|name| name.to_string()).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> MqConfig {
        MqConfig::from_value(json!({
            "server": "mq.example.com",
            "port": 5673,
            "users": {
                "test_service": {"user": "alice", "password": "s3cret"},
                "sparse_service": {"user": "bob"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn instances_get_distinct_service_ids() {
        let a = MqConnector::new(Some(test_config()), "test_service").unwrap();
        let b = MqConnector::new(Some(test_config()), "test_service").unwrap();
        assert_ne!(a.service_id(), b.service_id());
    }

    #[test]
    fn from_value_unwraps_mq_key() {
        let connector = MqConnector::from_value(
            json!({"MQ": {"users": {"test_service": {"user": "alice"}}}}),
            "test_service",
        )
        .unwrap();
        assert_eq!(connector.mq_credentials().unwrap().username, "alice");
    }

    #[test]
    fn credentials_resolve_from_users_table() {
        let connector = MqConnector::new(Some(test_config()), "test_service").unwrap();
        let credentials = connector.mq_credentials().unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn missing_credential_fields_default_to_guest() {
        let connector = MqConnector::new(Some(test_config()), "sparse_service").unwrap();
        let credentials = connector.mq_credentials().unwrap();
        assert_eq!(credentials.username, "bob");
        assert_eq!(credentials.password, "guest");
    }

    #[test]
    fn unknown_service_is_a_configuration_error() {
        let connector = MqConnector::new(Some(test_config()), "ghost_service").unwrap();
        assert!(matches!(
            connector.mq_credentials(),
            Err(ConnectorError::Configuration(_))
        ));
    }

    #[test]
    fn connection_params_use_configured_endpoint() {
        let connector = MqConnector::new(Some(test_config()), "test_service").unwrap();
        let params = connector
            .connection_params("/neon", ConnectionOptions::default())
            .unwrap();
        assert_eq!(params.host, "mq.example.com");
        assert_eq!(params.port, 5673);
        assert_eq!(params.vhost, "/neon");
        assert_eq!(params.credentials, Credentials::new("alice", "s3cret"));
    }

    #[test]
    fn connection_params_fall_back_to_localhost() {
        let config = MqConfig::from_value(json!({
            "users": {"test_service": {}}
        }))
        .unwrap();
        let connector = MqConnector::new(Some(config), "test_service").unwrap();
        let params = connector
            .connection_params("/", ConnectionOptions::default())
            .unwrap();
        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 5672);
        assert_eq!(params.credentials, Credentials::new("guest", "guest"));
    }

    #[test]
    fn run_consumers_with_empty_registry_is_a_no_op() {
        let mut connector = MqConnector::new(Some(test_config()), "test_service").unwrap();
        connector.run_consumers(&[]);
        connector.run_consumers(&["nobody_home"]);
        assert!(connector.consumer_names().is_empty());
    }

    #[tokio::test]
    async fn stop_consumers_with_nothing_running_is_ok() {
        let mut connector = MqConnector::new(Some(test_config()), "test_service").unwrap();
        assert!(connector.stop_consumers(&[]).await.is_ok());
        assert!(connector.stop().await.is_ok());
    }

    #[test]
    fn unique_ids_differ() {
        assert_ne!(MqConnector::create_unique_id(), MqConnector::create_unique_id());
    }

    struct EchoService {
        connector: MqConnector,
    }

    impl MqService for EchoService {
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

    #[test]
    fn services_attach_through_the_trait() {
        let service = EchoService::attach(Some(test_config()), "test_service").unwrap();
        assert_eq!(service.connector().service_name(), "test_service");
        assert_eq!(service.connector().service_id().len(), 32);
    }
}
