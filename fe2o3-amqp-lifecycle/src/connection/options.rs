use std::{fmt, time::Duration};

use super::{
    DEFAULT_CHANNEL_MAX, DEFAULT_MAX_FRAME_SIZE, DEFAULT_OPERATION_TIMEOUT, DEFAULT_PORT,
    MIN_MAX_FRAME_SIZE,
};

/// Transport the engine should establish
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Plain TCP
    #[default]
    Tcp,

    /// TLS over TCP
    Tls,

    /// WebSocket, with the path of the endpoint
    WebSocket {
        /// Path of the websocket endpoint
        path: String,
    },
}

/// Options of a [`Connection`](super::Connection)
///
/// The transport related fields are handed to the engine untouched. `operation_timeout` bounds
/// every open, close, begin and attach issued through the connection and its children.
///
/// # Default configuration
///
/// | Field | Default Value |
/// |-------|---------------|
/// |`host`| `"localhost"` |
/// |`port`| [`DEFAULT_PORT`] |
/// |`transport`| [`TransportKind::Tcp`] |
/// |`max_frame_size`| [`DEFAULT_MAX_FRAME_SIZE`] |
/// |`channel_max`| [`DEFAULT_CHANNEL_MAX`] |
/// |`idle_time_out`| `None` |
/// |`operation_timeout`| [`DEFAULT_OPERATION_TIMEOUT`] |
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Id of the connection. The engine generates one if this is `None`
    pub connection_id: Option<String>,

    /// Container id. The container's id is used if this is `None`
    pub container_id: Option<String>,

    /// Host to connect to
    pub host: String,

    /// Port to connect to
    pub port: u16,

    /// Hostname sent in the open frame, defaults to `host`
    pub hostname: Option<String>,

    /// SASL PLAIN username
    pub username: Option<String>,

    /// SASL PLAIN password
    pub password: Option<String>,

    /// Transport
    pub transport: TransportKind,

    /// Max frame size
    pub max_frame_size: u32,

    /// Channel max
    pub channel_max: u16,

    /// Idle time out
    pub idle_time_out: Option<Duration>,

    /// Deadline of every lifecycle operation
    pub operation_timeout: Duration,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("connection_id", &self.connection_id)
            .field("container_id", &self.container_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("transport", &self.transport)
            .field("max_frame_size", &self.max_frame_size)
            .field("channel_max", &self.channel_max)
            .field("idle_time_out", &self.idle_time_out)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connection_id: None,
            container_id: None,
            host: String::from("localhost"),
            port: DEFAULT_PORT,
            hostname: None,
            username: None,
            password: None,
            transport: TransportKind::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            idle_time_out: None,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    /// Creates a [`Builder`] for [`ConnectionOptions`]
    pub fn builder() -> Builder {
        Builder::new()
    }
}

/// Builder of [`ConnectionOptions`]
#[derive(Debug, Clone, Default)]
pub struct Builder {
    options: ConnectionOptions,
}

impl Builder {
    /// Creates a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the connection
    pub fn connection_id(mut self, id: impl Into<String>) -> Self {
        self.options.connection_id = Some(id.into());
        self
    }

    /// Container id
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.options.container_id = Some(id.into());
        self
    }

    /// Host and port
    pub fn address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.options.host = host.into();
        self.options.port = port;
        self
    }

    /// Hostname sent in the open frame
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.options.hostname = Some(hostname.into());
        self
    }

    /// SASL PLAIN credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.username = Some(username.into());
        self.options.password = Some(password.into());
        self
    }

    /// Transport
    pub fn transport(mut self, transport: TransportKind) -> Self {
        self.options.transport = transport;
        self
    }

    /// Max frame size. Values below the protocol minimum are raised to it
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.options.max_frame_size = std::cmp::max(MIN_MAX_FRAME_SIZE, max_frame_size);
        self
    }

    /// Channel max
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.options.channel_max = channel_max;
        self
    }

    /// Idle time out
    pub fn idle_time_out(mut self, idle_time_out: Duration) -> Self {
        self.options.idle_time_out = Some(idle_time_out);
        self
    }

    /// Deadline of every lifecycle operation
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.options.operation_timeout = timeout;
        self
    }

    /// Finishes the configuration
    pub fn build(self) -> ConnectionOptions {
        self.options
    }
}

impl From<Builder> for ConnectionOptions {
    fn from(builder: Builder) -> Self {
        builder.build()
    }
}
