// src/connection.rs

use std::fmt;
use std::time::Duration;

use lapin::types::AMQPValue;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::ConnectionProperties;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_CREDENTIAL: &str = "guest";

/// Broker login pair for one service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIAL, DEFAULT_CREDENTIAL)
    }
}

// Password must not leak into logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Transport tuning knobs, mapped onto the AMQP URI query string.
///
/// These cover the free-form options callers may attach to a connection;
/// host, port, vhost and credentials are fixed by [`ConnectionParams`] and
/// cannot be overridden from here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub heartbeat: Option<u16>,
    pub connection_timeout: Option<Duration>,
    pub frame_max: Option<u32>,
    pub channel_max: Option<u16>,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = Some(seconds);
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn with_frame_max(mut self, frame_max: u32) -> Self {
        self.frame_max = Some(frame_max);
        self
    }

    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = Some(channel_max);
        self
    }
}

/// Everything needed to open one broker connection.
///
/// Built fresh for every connection attempt and never cached across
/// reconnects, so credential or config changes take effect on the next
/// attempt.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub credentials: Credentials,
    pub options: ConnectionOptions,
}

impl ConnectionParams {
    /// Renders the typed AMQP URI lapin connects with.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.credentials.username.clone(),
                    password: self.credentials.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                frame_max: self.options.frame_max,
                channel_max: self.options.channel_max,
                heartbeat: self.options.heartbeat,
                connection_timeout: self
                    .options
                    .connection_timeout
                    .map(|timeout| timeout.as_millis() as u64),
                ..AMQPQueryString::default()
            },
        }
    }
}

/// Connection properties identifying the attached service, visible in the
/// broker's management UI and connection listings.
pub fn connection_properties(service_name: &str, service_id: &str) -> ConnectionProperties {
    let mut properties = ConnectionProperties::default()
        .with_connection_name(format!("{service_name}-{service_id}").into());
    properties.client_properties.insert(
        "service_name".into(),
        AMQPValue::LongString(service_name.into()),
    );
    properties
        .client_properties
        .insert("service_id".into(), AMQPValue::LongString(service_id.into()));
    properties
}
