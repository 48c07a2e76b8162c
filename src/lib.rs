//! Device-side MQTT session manager for a small networked pin controller.
//!
//! The crate keeps one persistent connection to a broker alive from a
//! dedicated processing thread: it connects with bounded retries, runs the
//! QoS 1/2 acknowledgment handshakes itself, dispatches inbound publications
//! to per-topic handlers and forwards GPIO pin edges as publications.
//!
//! The session core is deliberately protocol-agnostic at its edges. Byte
//! transport is behind the [`transport`] gate traits and packet
//! encoding/decoding behind the [`codec`] traits, so the same core runs over
//! plain TCP in production and over scripted doubles in tests.
//!
//! ```no_run
//! use pcu_mqtt::codec::{EventDecoder, RequestEncoder};
//! use pcu_mqtt::{MqttSession, SessionOptions, TcpConnector, TopicRegistry};
//!
//! fn run(
//!     encoder: Box<dyn RequestEncoder>,
//!     decoder: Box<dyn EventDecoder>,
//! ) -> Result<(), pcu_mqtt::SessionError> {
//!     let options = SessionOptions::new("pcu-7", "broker.local", 1883);
//!     let connector = Box::new(TcpConnector::new(options.broker_endpoint()));
//!
//!     let mut registry = TopicRegistry::new();
//!     registry.on("dev/pcu-7/out/5", |ctx| {
//!         let mut level = [0u8; 1];
//!         ctx.read_payload(&mut level).map_err(|_| pcu_mqtt::Rejection("read"))?;
//!         Ok(())
//!     });
//!
//!     let mut session = MqttSession::new(options, encoder)?;
//!     session.start(connector, decoder, registry)?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod pins;
pub mod session;
pub mod testing;
pub mod transport;

pub use codec::{MessageId, ProtocolEvent, ProtocolRequest, QoS};
pub use config::{ConfigError, SessionConfig};
pub use pins::{PinEvent, PinEventPump, PinEventSender, PinPumpOptions};
pub use session::{
    ConnectError, DispatchContext, LinkState, MqttSession, Rejection, RetryPolicy, SessionError,
    SessionOptions, TopicRegistry,
};
pub use transport::{TcpConnector, TransportError};
