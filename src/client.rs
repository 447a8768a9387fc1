//! EventBus bridge client implementation

use crate::codec;
use crate::config::EventBusConfig;
use crate::error::{EventBusError, Result};
use crate::messages::{Envelope, Headers, MessageType};
use crate::registry::{HandlerId, HandlerRegistry, MessageHandler};
use crate::transport::{BoxedStream, Connector, OpenError};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected
    New,
    /// Attempting to connect
    Connecting,
    /// Connected and ready
    Connected,
    /// `close()` in progress
    Closing,
    /// Closed by the user; never reopened
    Closed,
    /// Dropped by an I/O or TLS failure
    Broken,
}

/// Faults that do not belong to any caller
#[derive(Debug, Clone)]
pub enum ErrorEvent {
    /// `err` envelope from the bridge
    Server(Envelope),
    /// Envelope the protocol does not allow here
    Protocol { reason: String, envelope: Envelope },
    /// Frame whose payload could not be decoded
    Malformed(String),
    /// No reply arrived in time
    ReplyTimeout {
        address: String,
        reply_address: String,
    },
}

/// Handler for [`ErrorEvent`]s
pub type ErrorHandler = Arc<dyn Fn(ErrorEvent) + Send + Sync>;

/// Per-message options for `send`
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    pub headers: Option<Headers>,
    /// Reply address to put on the envelope; generated when a reply handler is
    /// given and this is unset
    pub reply_address: Option<String>,
    /// Overrides the configured reply timeout
    pub reply_timeout: Option<Duration>,
}

impl DeliveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn reply_address(mut self, address: impl Into<String>) -> Self {
        self.reply_address = Some(address.into());
        self
    }

    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }
}

/// A registered handler that can be unregistered
pub struct Registration {
    address: String,
    id: HandlerId,
    client: Arc<ClientInner>,
}

impl Registration {
    /// Get the address the handler listens on
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Remove this handler; the last handler on a server address sends `unregister`
    pub async fn unregister(self) -> Result<()> {
        self.client
            .unregister_handler(&self.address, Some(self.id))
            .await
    }
}

/// State guarded by the client's single lock
struct Shared {
    state: ConnectionState,
    /// Bumped on every connect and on close; background tasks of an older
    /// generation stop on their next check
    generation: u64,
    registry: HandlerRegistry,
    last_pong: Option<Instant>,
    /// A write on the current socket failed with a connection reset
    peer_reset: bool,
}

/// Internal client state
struct ClientInner {
    config: EventBusConfig,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<ConnectionState>,

    // Write half of the socket; the lock serializes frame writes
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,

    // Only one connect loop at a time
    connect_lock: tokio::sync::Mutex<()>,

    // Receive and heartbeat tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,

    error_handler: RwLock<ErrorHandler>,
}

/// EventBus bridge client
///
/// Provides send/publish, handler registration, reply correlation and
/// automatic reconnection over one bridge connection.
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct EventBusClient {
    inner: Arc<ClientInner>,
}

impl EventBusClient {
    /// Create a new client with the given configuration; does not connect
    pub fn new(config: EventBusConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::New);

        let inner = Arc::new(ClientInner {
            config,
            shared: Mutex::new(Shared {
                state: ConnectionState::New,
                generation: 0,
                registry: HandlerRegistry::new(),
                last_pong: None,
                peer_reset: false,
            }),
            state_tx,
            writer: tokio::sync::Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            error_handler: RwLock::new(default_error_handler()),
        });

        Self { inner }
    }

    /// Create a client and connect right away if `connect_on_start` is set
    pub async fn start(config: EventBusConfig) -> Result<Self> {
        let connect_now = config.connect_on_start;
        let client = Self::new(config);
        if connect_now {
            client.connect().await?;
        }
        Ok(client)
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// When the last pong arrived on the current connection
    pub fn last_pong(&self) -> Option<Instant> {
        self.inner.shared.lock().last_pong
    }

    /// Number of local callbacks on an address
    pub fn handler_count(&self, address: &str) -> usize {
        self.inner.shared.lock().registry.handler_count(address)
    }

    /// Replace the error handler (the default logs)
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(ErrorEvent) + Send + Sync + 'static,
    {
        *self.inner.error_handler.write() = Arc::new(handler);
    }

    /// Connect to the bridge.
    ///
    /// No-op when connected; fails with [`EventBusError::Closed`] after `close()`.
    /// Transient failures are retried every `retry_interval` until
    /// `connection_timeout` runs out, after which this returns `Ok(())` with
    /// the client still disconnected. TLS failures are not retried.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Close the connection and drop all local handlers
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    /// Send a point-to-point message
    pub async fn send<T>(&self, address: &str, body: &T, options: DeliveryOptions) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::send(address, options.headers, to_body(body)?, options.reply_address)?;
        self.inner.ensure_connected().await?;
        self.inner.write_envelope(&envelope).await
    }

    /// Send a message and wait for one reply.
    ///
    /// The handler runs on the receive task when the reply arrives. On timeout
    /// the error handler gets [`ErrorEvent::ReplyTimeout`] and this returns
    /// [`EventBusError::ReplyTimeout`]. The reply registration is removed
    /// either way.
    pub async fn send_with_reply<T, F>(
        &self,
        address: &str,
        body: &T,
        options: DeliveryOptions,
        handler: F,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner
            .send_with_reply(address, to_body(body)?, options, Arc::new(handler))
            .await
            .map(|_| ())
    }

    /// Send a message and return the reply envelope
    pub async fn request<T>(&self, address: &str, body: &T, options: DeliveryOptions) -> Result<Envelope>
    where
        T: Serialize + ?Sized,
    {
        self.inner
            .send_with_reply(address, to_body(body)?, options, Arc::new(|_: &Envelope| {}))
            .await
    }

    /// Publish a message to every handler on the address
    pub async fn publish<T>(&self, address: &str, body: &T, headers: Option<Headers>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::publish(address, headers, to_body(body)?)?;
        self.inner.ensure_connected().await?;
        self.inner.write_envelope(&envelope).await
    }

    /// Answer a request with a failure
    pub async fn fail(&self, address: &str, failure_code: i64, message: &str) -> Result<()> {
        let envelope = Envelope::failure(address, failure_code, message)?;
        self.inner.ensure_connected().await?;
        self.inner.write_envelope(&envelope).await
    }

    /// Register a handler on an address.
    ///
    /// The first handler on an address sends one `register` frame; further
    /// handlers are local fan-out. If the frame cannot be sent the handler
    /// stays registered locally (and is announced on the next connect) and
    /// [`EventBusError::RegistrationFailed`] is returned.
    pub async fn register_handler<F>(&self, address: &str, handler: F) -> Result<Registration>
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.inner.register_handler(address, Arc::new(handler)).await?;
        Ok(Registration {
            address: address.to_string(),
            id,
            client: self.inner.clone(),
        })
    }

    /// Unregister one handler, or all handlers on the address when `id` is `None`
    pub async fn unregister_handler(&self, address: &str, id: Option<HandlerId>) -> Result<()> {
        self.inner.unregister_handler(address, id).await
    }
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    fn apply_state(&self, shared: &mut Shared, state: ConnectionState) {
        if shared.state != state {
            debug!(from = ?shared.state, to = ?state, "Connection state changed");
        }
        shared.state = state;
        self.state_tx.send_replace(state);
    }

    /// Move to `state` unless the client has been closed
    fn transition(&self, state: ConnectionState) -> bool {
        let mut shared = self.shared.lock();
        if matches!(shared.state, ConnectionState::Closing | ConnectionState::Closed) {
            return false;
        }
        self.apply_state(&mut shared, state);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        let shared = self.shared.lock();
        shared.generation == generation && shared.state == ConnectionState::Connected
    }

    fn report(&self, event: ErrorEvent) {
        let handler = self.error_handler.read().clone();
        handler(event);
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let _connecting = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                debug!("Client has been closed");
                return Err(EventBusError::Closed);
            }
            _ => {}
        }

        let connector = match Connector::from_config(&self.config) {
            Ok(connector) => connector,
            Err(e) => {
                error!(error = ?e, "Invalid TLS configuration");
                self.transition(ConnectionState::Broken);
                return Err(e.into());
            }
        };

        let deadline = (!self.config.retries_forever())
            .then(|| Instant::now() + self.config.connection_timeout);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if !self.transition(ConnectionState::Connecting) {
                return Err(EventBusError::Closed);
            }

            match connector.open().await {
                Ok(stream) => return self.establish(stream).await,
                Err(OpenError::Tls(message)) => {
                    error!(error = %message, "TLS failure, not retrying");
                    self.transition(ConnectionState::Broken);
                    return Err(EventBusError::Tls(message));
                }
                Err(OpenError::Io(e)) => {
                    warn!(attempt, error = %e, "Failed to connect to bridge");
                }
            }

            let delay = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        error!(attempts = attempt, "Failed to connect within the connection timeout");
                        self.transition(ConnectionState::Broken);
                        return Ok(());
                    }
                    self.config.retry_interval.min(remaining)
                }
                None => self.config.retry_interval,
            };

            debug!("Retrying connect in {:?}", delay);
            sleep(delay).await;
        }
    }

    /// Install a freshly opened stream as the current generation
    async fn establish(self: &Arc<Self>, stream: BoxedStream) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);

        let mut slot = self.writer.lock().await;
        let (generation, replay) = {
            let mut shared = self.shared.lock();
            if matches!(shared.state, ConnectionState::Closing | ConnectionState::Closed) {
                debug!("Closed while connecting, dropping new stream");
                return Err(EventBusError::Closed);
            }
            shared.generation += 1;
            shared.last_pong = None;
            shared.peer_reset = false;
            self.apply_state(&mut shared, ConnectionState::Connected);
            (shared.generation, shared.registry.server_addresses())
        };
        *slot = Some(writer);
        drop(slot);

        info!(
            host = %self.config.host,
            port = self.config.port,
            generation,
            "Connected to bridge"
        );

        let receiver = tokio::spawn(receive_loop(self.clone(), generation, reader));
        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), generation));
        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|task| !task.is_finished());
            tasks.push(receiver);
            tasks.push(heartbeat);
        }

        // The bridge forgets registrations with the old socket
        for address in replay {
            debug!(address = %address, "Re-registering with bridge");
            let result = match Envelope::register(&address) {
                Ok(envelope) => self.write_envelope(&envelope).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(address = %address, error = %e, "Failed to re-register");
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut shared = self.shared.lock();
            let state = shared.state;
            match state {
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Broken => {
                    debug!(state = ?state, "Nothing to close");
                    return Ok(());
                }
                _ => {}
            }
            shared.generation += 1;
            self.apply_state(&mut shared, ConnectionState::Closing);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Failed to shut down the socket");
            }
        }

        {
            let mut shared = self.shared.lock();
            debug!(entries = shared.registry.len(), "Dropping local handlers");
            shared.registry.clear();
            self.apply_state(&mut shared, ConnectionState::Closed);
        }

        info!("Connection closed");
        Ok(())
    }

    /// Make sure there is a usable connection, connecting on demand if allowed
    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(EventBusError::NotConnected)
            }
            _ => {}
        }

        if !self.config.auto_connect {
            return Err(EventBusError::NotConnected);
        }

        self.connect().await?;
        if self.state() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(EventBusError::NotConnected)
        }
    }

    async fn write_envelope(&self, envelope: &Envelope) -> Result<()> {
        let mut slot = self.writer.lock().await;
        self.write_locked(&mut slot, envelope).await
    }

    /// Write through a writer slot the caller has already locked
    async fn write_locked(
        &self,
        slot: &mut Option<WriteHalf<BoxedStream>>,
        envelope: &Envelope,
    ) -> Result<()> {
        let writer = slot.as_mut().ok_or(EventBusError::NotConnected)?;
        let result = codec::write_frame(writer, envelope).await;
        if matches!(result, Err(EventBusError::ConnectionReset)) {
            // Once a write has taken the reset the reader only sees EOF
            self.shared.lock().peer_reset = true;
        }
        result
    }

    async fn register_handler(self: &Arc<Self>, address: &str, handler: MessageHandler) -> Result<HandlerId> {
        let register = Envelope::register(address)?;

        let needs_server = !self.shared.lock().registry.is_at_server(address);
        let connected = if needs_server {
            self.ensure_connected().await
        } else {
            Ok(())
        };

        // Marking and announcing under the writer lock keeps a reconnect's
        // replay snapshot from also sending this register
        let mut slot = self.writer.lock().await;
        let (id, announce) = self
            .shared
            .lock()
            .registry
            .register_with_server(address, handler);

        if announce {
            let sent = match connected {
                Ok(()) => self.write_locked(&mut slot, &register).await,
                Err(e) => Err(e),
            };
            drop(slot);
            if let Err(e) = sent {
                error!(address = %address, error = %e, "Registration failed");
                return Err(EventBusError::RegistrationFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            debug!(address = %address, "Registered with bridge");
        }

        Ok(id)
    }

    async fn unregister_handler(self: &Arc<Self>, address: &str, id: Option<HandlerId>) -> Result<()> {
        let removal = self.shared.lock().registry.unregister(address, id);
        if !removal.removed {
            debug!(address = %address, "No handler to unregister");
        }

        if removal.announce {
            let sent = match Envelope::unregister(address) {
                Ok(envelope) => match self.ensure_connected().await {
                    Ok(()) => self.write_envelope(&envelope).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                error!(address = %address, error = %e, "Unregistering failed");
                return Err(EventBusError::UnregistrationFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                });
            }
            debug!(address = %address, "Unregistered from bridge");
        }

        Ok(())
    }

    async fn send_with_reply(
        self: &Arc<Self>,
        address: &str,
        body: Option<serde_json::Value>,
        options: DeliveryOptions,
        handler: MessageHandler,
    ) -> Result<Envelope> {
        let reply_timeout = match options.reply_timeout {
            Some(t) if t.is_zero() => {
                return Err(EventBusError::Configuration(
                    "reply timeout must be at least 1ms".to_string(),
                ))
            }
            Some(t) => t,
            None => self.config.reply_timeout,
        };
        let reply_address = options
            .reply_address
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let envelope = Envelope::send(address, options.headers, body, Some(reply_address.clone()))?;

        self.ensure_connected().await?;

        let (tx, mut rx) = oneshot::channel::<Envelope>();
        let tx = Mutex::new(Some(tx));
        let correlated: MessageHandler = Arc::new(move |reply: &Envelope| {
            handler(reply);
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reply.clone());
            }
        });
        let id = self.shared.lock().registry.register_reply(&reply_address, correlated);

        let outcome = match self.write_envelope(&envelope).await {
            Ok(()) => timeout(reply_timeout, &mut rx).await,
            Err(e) => {
                self.shared.lock().registry.unregister(&reply_address, Some(id));
                return Err(e);
            }
        };

        let handled = {
            let mut shared = self.shared.lock();
            let handled = shared.registry.is_handled(&reply_address, id);
            shared.registry.unregister(&reply_address, Some(id));
            handled
        };

        match outcome {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                debug!(reply_address = %reply_address, "Reply wait abandoned, registry was cleared");
                Err(EventBusError::NotConnected)
            }
            // The reply raced the timer; its handler is already running
            Err(_) if handled => rx.await.map_err(|_| {
                EventBusError::Protocol(format!("reply handler on {} did not complete", reply_address))
            }),
            Err(_) => {
                self.report(ErrorEvent::ReplyTimeout {
                    address: address.to_string(),
                    reply_address: reply_address.clone(),
                });
                Err(EventBusError::ReplyTimeout { reply_address })
            }
        }
    }

    /// Read frames until the stream fails or this generation is superseded.
    ///
    /// Returns the reason the loop stopped.
    async fn read_frames(&self, generation: u64, reader: &mut ReadHalf<BoxedStream>) -> EventBusError {
        loop {
            let frame = {
                let read = codec::read_frame(&mut *reader, self.config.max_frame_size);
                tokio::pin!(read);
                loop {
                    tokio::select! {
                        result = &mut read => break result,
                        _ = sleep(self.config.socket_timeout) => {
                            if !self.is_current(generation) {
                                return EventBusError::Closed;
                            }
                            debug!("No frame within socket timeout, reading again");
                        }
                    }
                }
            };

            match frame {
                Ok(envelope) => self.handle_envelope(envelope),
                Err(EventBusError::Serialization(e)) => {
                    self.report(ErrorEvent::Malformed(e.to_string()));
                }
                Err(e) => return e,
            }

            if !self.is_current(generation) {
                return EventBusError::Closed;
            }
        }
    }

    fn handle_envelope(&self, envelope: Envelope) {
        match envelope.kind {
            MessageType::Message => match envelope.address.clone().filter(|a| !a.is_empty()) {
                Some(address) => self.dispatch(&address, &envelope),
                None => self.report(ErrorEvent::Protocol {
                    reason: "message without address".to_string(),
                    envelope,
                }),
            },
            MessageType::Err => self.report(ErrorEvent::Server(envelope)),
            MessageType::Pong => {
                debug!("Got pong");
                self.shared.lock().last_pong = Some(Instant::now());
            }
            other => self.report(ErrorEvent::Protocol {
                reason: format!("unexpected envelope type {:?}", other),
                envelope,
            }),
        }
    }

    fn dispatch(&self, address: &str, envelope: &Envelope) {
        let targets = self.shared.lock().registry.dispatch_targets(address);

        let Some(handlers) = targets else {
            warn!(address = %address, "No handler found on address");
            return;
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(envelope))).is_err() {
                error!(address = %address, "Handler panicked");
            }
        }
    }

    /// Settle the state after a receive loop of `generation` stopped.
    ///
    /// Returns whether this generation was marked broken. A reset seen by the
    /// reader or by any write on this socket clears the registry.
    fn finish_generation(&self, generation: u64, reason: &EventBusError) -> bool {
        let mut shared = self.shared.lock();
        if shared.generation != generation {
            return false;
        }

        let state = shared.state;
        if state != ConnectionState::Connected {
            debug!(state = ?state, "Connection already settled");
            return false;
        }

        if shared.peer_reset || matches!(reason, EventBusError::ConnectionReset) {
            // Registrations died with the socket on the bridge side
            info!(entries = shared.registry.len(), "Connection reset by bridge");
            shared.registry.clear();
        } else {
            match reason {
                EventBusError::TransportClosed => info!("Bridge closed the connection"),
                other => error!(error = %other, "Connection was broken"),
            }
        }
        self.apply_state(&mut shared, ConnectionState::Broken);
        true
    }

    fn check_last_pong(&self) {
        let last_pong = self.shared.lock().last_pong;
        if let Some(last_pong) = last_pong {
            let since = last_pong.elapsed();
            if since > self.config.ping_interval * 2 {
                warn!(since = ?since, "ping/pong is slow");
            }
        }
    }
}

/// Receive loop for one connection generation
async fn receive_loop(inner: Arc<ClientInner>, generation: u64, mut reader: ReadHalf<BoxedStream>) {
    let reason = inner.read_frames(generation, &mut reader).await;
    drop(reader);
    debug!(generation, reason = %reason, "Receive loop stopped");

    // Taking the writer lock lets an in-flight write record a reset first
    let mut slot = inner.writer.lock().await;
    let broken = inner.finish_generation(generation, &reason);
    let stale = if broken { slot.take() } else { None };
    drop(slot);

    if let Some(mut writer) = stale {
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Failed to shut down the broken socket");
        }
    }

    if broken && inner.config.auto_reconnect {
        reconnect(inner).await;
    }
}

// Boxed so the receive loop and connect() do not form a recursive future type
fn reconnect(inner: Arc<ClientInner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        info!("Reconnecting to bridge");
        if let Err(e) = inner.connect().await {
            warn!(error = %e, "Reconnect failed");
        }
    })
}

/// Heartbeat loop for one connection generation
async fn heartbeat_loop(inner: Arc<ClientInner>, generation: u64) {
    loop {
        if !inner.is_current(generation) {
            debug!(generation, "Heartbeat stopped");
            break;
        }

        inner.check_last_pong();
        match inner.write_envelope(&Envelope::ping()).await {
            Ok(()) => debug!("Sent ping"),
            Err(e) if e.is_disconnect() => debug!(error = %e, "Error on sending ping"),
            Err(e) => warn!(error = %e, "Error on sending ping"),
        }

        sleep(inner.config.ping_interval).await;
    }
}

fn to_body<T: Serialize + ?Sized>(body: &T) -> Result<Option<serde_json::Value>> {
    let value = serde_json::to_value(body)?;
    Ok((!value.is_null()).then_some(value))
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|event: ErrorEvent| match event {
        ErrorEvent::Server(envelope) => error!(
            failure_code = ?envelope.failure_code,
            failure_type = ?envelope.failure_type,
            message = ?envelope.message,
            "Got error message from bridge"
        ),
        ErrorEvent::Protocol { reason, envelope } => {
            error!(reason = %reason, envelope = ?envelope, "Protocol violation")
        }
        ErrorEvent::Malformed(reason) => error!(reason = %reason, "Undecodable frame"),
        ErrorEvent::ReplyTimeout {
            address,
            reply_address,
        } => warn!(address = %address, reply_address = %reply_address, "Reply timed out"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_initial_state() {
        let client = EventBusClient::new(EventBusConfig::new("localhost", 7000));

        assert_eq!(client.connection_state(), ConnectionState::New);
        assert!(!client.is_connected());
        assert!(client.last_pong().is_none());
    }

    #[test]
    fn test_state_receiver() {
        let client = EventBusClient::new(EventBusConfig::new("localhost", 7000));
        let rx = client.state_receiver();
        assert_eq!(*rx.borrow(), ConnectionState::New);
    }

    #[test]
    fn test_delivery_options_builder() {
        let options = DeliveryOptions::new()
            .header("a", "1")
            .header("b", "2")
            .reply_address("reply-here")
            .reply_timeout(Duration::from_millis(500));

        let headers = options.headers.unwrap();
        assert_eq!(headers.get("a").map(String::as_str), Some("1"));
        assert_eq!(headers.get("b").map(String::as_str), Some("2"));
        assert_eq!(options.reply_address.as_deref(), Some("reply-here"));
        assert_eq!(options.reply_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_to_body() {
        assert_eq!(to_body(&serde_json::Value::Null).unwrap(), None);
        assert_eq!(to_body(&()).unwrap(), None);
        assert_eq!(
            to_body(&serde_json::json!({"x": 1})).unwrap(),
            Some(serde_json::json!({"x": 1}))
        );
    }

    fn connected_with_handler(address: &str) -> EventBusClient {
        let client = EventBusClient::new(EventBusConfig::new("localhost", 7000));
        {
            let mut shared = client.inner.shared.lock();
            shared.generation = 1;
            shared.registry.register_with_server(address, Arc::new(|_: &Envelope| {}));
            client.inner.apply_state(&mut shared, ConnectionState::Connected);
        }
        client
    }

    #[test]
    fn test_reset_on_write_clears_registry_after_eof() {
        let client = connected_with_handler("a");
        client.inner.shared.lock().peer_reset = true;

        assert!(client.inner.finish_generation(1, &EventBusError::TransportClosed));
        assert_eq!(client.connection_state(), ConnectionState::Broken);
        assert_eq!(client.handler_count("a"), 0);
    }

    #[test]
    fn test_eof_keeps_registry() {
        let client = connected_with_handler("a");

        assert!(client.inner.finish_generation(1, &EventBusError::TransportClosed));
        assert_eq!(client.connection_state(), ConnectionState::Broken);
        assert_eq!(client.handler_count("a"), 1);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let client = connected_with_handler("a");
        client.inner.shared.lock().peer_reset = true;

        assert!(!client.inner.finish_generation(0, &EventBusError::ConnectionReset));
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.handler_count("a"), 1);
    }
}

#[cfg(test)]
mod async_tests {
    use super::*;
    use tokio::net::TcpListener;

    fn offline_config() -> EventBusConfig {
        EventBusConfig::new("127.0.0.1", 7000).no_auto_connect()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_publish_not_connected() {
        let client = EventBusClient::new(offline_config());
        let result = client.publish("topic", &serde_json::json!({"x": 1}), None).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let client = EventBusClient::new(offline_config());
        let result = client.send("echo", &"hi", DeliveryOptions::new()).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_without_address_fails_fast() {
        let client = EventBusClient::new(offline_config());
        let result = client.send("", &"hi", DeliveryOptions::new()).await;
        assert!(matches!(result, Err(EventBusError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_zero_reply_timeout_rejected() {
        let client = EventBusClient::new(offline_config());
        let options = DeliveryOptions::new().reply_timeout(Duration::ZERO);
        let result = client.send_with_reply("echo", &"hi", options, |_| {}).await;
        assert!(matches!(result, Err(EventBusError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_register_not_connected_keeps_local_entry() {
        let client = EventBusClient::new(offline_config());
        let result = client.register_handler("news", |_| {}).await;

        assert!(matches!(
            result,
            Err(EventBusError::RegistrationFailed { ref address, .. }) if address == "news"
        ));
        assert_eq!(client.handler_count("news"), 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_address() {
        let client = EventBusClient::new(offline_config());
        assert!(client.unregister_handler("nobody", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_twice() {
        let client = EventBusClient::new(offline_config());

        assert!(client.close().await.is_ok());
        assert_eq!(client.connection_state(), ConnectionState::Closed);
        assert!(client.close().await.is_ok());
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let client = EventBusClient::new(offline_config());
        client.close().await.unwrap();

        let result = client.connect().await;
        assert!(matches!(result, Err(EventBusError::Closed)));
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_timeout_leaves_client_disconnected() {
        let config = EventBusConfig::new("127.0.0.1", closed_port().await)
            .connection_timeout(Duration::from_millis(200))
            .retry_interval(Duration::from_millis(50));
        let client = EventBusClient::new(config);

        let result = client.connect().await;
        assert!(result.is_ok());
        assert!(!client.is_connected());
        assert_eq!(client.connection_state(), ConnectionState::Broken);
    }

    #[tokio::test]
    async fn test_start_without_eager_connect() {
        let client = EventBusClient::start(offline_config()).await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_start_with_eager_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(stream, _)| stream) });

        let config = EventBusConfig::new("127.0.0.1", port).connect_on_start();
        let client = EventBusClient::start(config).await.unwrap();
        assert!(client.is_connected());

        let _server_side = accept.await.unwrap().unwrap();
        client.close().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Closed);
    }
}
