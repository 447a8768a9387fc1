//! Byte stream to the bridge, plain TCP or TLS-wrapped

use crate::config::EventBusConfig;
use crate::error::EventBusError;
use rustls::pki_types::ServerName;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Any bidirectional stream the client can frame over
pub trait BridgeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BridgeStream for T {}

pub type BoxedStream = Box<dyn BridgeStream>;

/// Why opening the stream failed
#[derive(Debug)]
pub enum OpenError {
    /// Transient socket failure, worth retrying
    Io(io::Error),
    /// TLS setup or handshake failure, not retried
    Tls(String),
}

impl From<OpenError> for EventBusError {
    fn from(e: OpenError) -> Self {
        match e {
            OpenError::Io(e) => EventBusError::Transport(e.to_string()),
            OpenError::Tls(msg) => EventBusError::Tls(msg),
        }
    }
}

/// Opens streams to one bridge endpoint
pub struct Connector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: Option<TlsConnector>,
}

impl Connector {
    /// Build a connector; TLS options are resolved here so bad TLS config fails once
    pub fn from_config(config: &EventBusConfig) -> Result<Self, OpenError> {
        let tls = match &config.tls {
            Some(options) => Some(options.connector().map_err(|e| OpenError::Tls(e.to_string()))?),
            None => None,
        };

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.socket_timeout,
            tls,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Open the stream, performing the TLS handshake when configured
    pub async fn open(&self) -> Result<BoxedStream, OpenError> {
        debug!(host = %self.host, port = self.port, tls = self.is_tls(), "Opening bridge stream");

        let tcp = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| OpenError::Io(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")))?
        .map_err(OpenError::Io)?;

        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let Some(tls) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| OpenError::Tls(format!("invalid server name {}: {}", self.host, e)))?;

        let stream = timeout(self.connect_timeout, tls.connect(server_name, tcp))
            .await
            .map_err(|_| OpenError::Tls("TLS handshake timed out".to_string()))?
            .map_err(|e| OpenError::Tls(e.to_string()))?;

        Ok(Box::new(stream))
    }
}
