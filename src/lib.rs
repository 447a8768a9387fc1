//! EventBus bridge client
//!
//! A client for the TCP EventBus bridge protocol: every frame is a 4-byte
//! big-endian length followed by a UTF-8 JSON envelope. The client keeps one
//! connection to the bridge, fans incoming messages out to local handlers,
//! correlates replies, pings the bridge and reconnects after failures.
//!
//! # Example
//!
//! ```no_run
//! use eventbus_bridge::{DeliveryOptions, EventBusClient, EventBusConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EventBusConfig::new("localhost", 7000);
//!     let client = EventBusClient::new(config);
//!
//!     client.connect().await?;
//!
//!     // Listen on an address
//!     let registration = client.register_handler("news.feed", |envelope| {
//!         println!("Received on {}: {:?}", envelope.address(), envelope.body());
//!     }).await?;
//!
//!     // Publish to every handler on an address
//!     client.publish("news.feed", &serde_json::json!({"headline": "hello"}), None).await?;
//!
//!     // Point-to-point with a reply
//!     let reply = client.request(
//!         "echo",
//!         &serde_json::json!({"value": 42}),
//!         DeliveryOptions::new().header("trace", "abc"),
//!     ).await?;
//!     println!("Reply: {:?}", reply.body());
//!
//!     registration.unregister().await?;
//!     client.close().await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
pub mod codec;
mod config;
mod error;
mod messages;
mod registry;
mod tls;
mod transport;

pub use client::{ConnectionState, DeliveryOptions, ErrorEvent, ErrorHandler, EventBusClient, Registration};
pub use config::EventBusConfig;
pub use error::{EventBusError, Result};
pub use messages::{Envelope, Headers, MessageType};
pub use registry::{HandlerId, MessageHandler};
pub use tls::{PeerVerification, TlsOptions};
