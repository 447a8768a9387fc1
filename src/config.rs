//! Configuration for the EventBus bridge client

use crate::codec::DEFAULT_MAX_FRAME_SIZE;
use crate::tls::TlsOptions;
use std::time::Duration;

/// Configuration for connecting to an EventBus bridge
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Bridge host name or IP
    pub host: String,

    /// Bridge TCP port
    pub port: u16,

    /// Socket timeout for connecting and for each read poll
    pub socket_timeout: Duration,

    /// Overall budget for one `connect()` call; zero retries forever
    pub connection_timeout: Duration,

    /// Delay between connect attempts
    pub retry_interval: Duration,

    /// Interval between keepalive pings
    pub ping_interval: Duration,

    /// How long `send_with_reply` waits for its reply
    pub reply_timeout: Duration,

    /// Largest frame payload accepted from the bridge, in bytes
    pub max_frame_size: usize,

    /// Connect on first use when not connected
    pub auto_connect: bool,

    /// Reconnect after the connection drops
    pub auto_reconnect: bool,

    /// Connect as part of `EventBusClient::start`
    pub connect_on_start: bool,

    /// Wrap the socket in TLS
    pub tls: Option<TlsOptions>,
}

impl EventBusConfig {
    /// Create a new configuration for the given bridge host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            socket_timeout: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(600),
            retry_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(60),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            auto_connect: true,
            auto_reconnect: true,
            connect_on_start: false,
            tls: None,
        }
    }

    /// Disable connecting on first use
    pub fn no_auto_connect(mut self) -> Self {
        self.auto_connect = false;
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Connect immediately in `EventBusClient::start`
    pub fn connect_on_start(mut self) -> Self {
        self.connect_on_start = true;
        self
    }

    /// Set the socket timeout
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// Set the overall connection timeout (zero = retry forever)
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the delay between connect attempts
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the reply timeout
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the largest accepted frame payload
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Use TLS with the given options
    pub fn tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }

    /// Whether connect attempts should retry without a deadline
    pub fn retries_forever(&self) -> bool {
        self.connection_timeout.is_zero()
    }
}
