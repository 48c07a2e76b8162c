//! MQTT session manager
//!
//! [`MqttSession`] owns one persistent broker connection and the dedicated
//! processing thread that services it. The thread exclusively owns the
//! receive path; the transmit path lives behind [`TxLink`]'s lock so
//! application threads can publish while the loop is blocked waiting for
//! input. Connection state is a single atomic cell readable from any thread
//! without taking the lock.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::codec::{
    CodecError, EventDecoder, MessageId, ProtocolRequest, QoS, RequestEncoder,
};
use crate::transport::{OutputGate, TransportConnector};

mod dispatch;
mod error;
mod events;
mod lifecycle;

pub use dispatch::{DispatchContext, Rejection, TopicHandler, TopicRegistry, MAX_TOPIC_LEN};
pub use error::{ConnectError, SessionError};
pub use lifecycle::RetryPolicy;

pub(crate) use dispatch::DispatchRouter;
pub(crate) use events::EventHandler;
pub(crate) use lifecycle::ProcessingLoop;

/// Connection state of the session as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Lock-free state cell shared between the processing thread and callers.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn get(&self) -> LinkState {
        if self.0.load(Ordering::Acquire) == 1 {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    pub(crate) fn set(&self, state: LinkState) {
        self.0
            .store(matches!(state, LinkState::Connected) as u8, Ordering::Release);
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub broker_addr: String,
    pub broker_port: u16,
    pub keep_alive: Duration,
    pub buffer_capacity: usize,
    pub retry: RetryPolicy,
}

impl SessionOptions {
    pub fn new(
        client_id: impl Into<String>,
        broker_addr: impl Into<String>,
        broker_port: u16,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            broker_addr: broker_addr.into(),
            broker_port,
            keep_alive: Duration::from_secs(60),
            buffer_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `host:port` string the transport connector dials.
    pub fn broker_endpoint(&self) -> String {
        format!("{}:{}", self.broker_addr, self.broker_port)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.client_id.is_empty() {
            return Err(SessionError::InvalidArgument("client_id must not be empty"));
        }
        if self.broker_addr.is_empty() {
            return Err(SessionError::InvalidArgument(
                "broker_addr must not be empty",
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(SessionError::InvalidArgument(
                "buffer_capacity must not be zero",
            ));
        }
        Ok(())
    }
}

struct TxShared {
    output: Option<Box<dyn OutputGate>>,
    encoder: Box<dyn RequestEncoder>,
    tx_buf: BytesMut,
    next_id: MessageId,
    last_sent: Instant,
}

/// Transmit half of the session.
///
/// Shared between the processing thread (acknowledgments, CONNECT, pings) and
/// application threads (publish, subscribe). The encoder and transmit buffer
/// live inside the lock so a packet is always encoded and written as one
/// unit, never interleaved with another sender's bytes.
pub(crate) struct TxLink {
    shared: Mutex<TxShared>,
    capacity: usize,
}

impl TxLink {
    pub(crate) fn new(encoder: Box<dyn RequestEncoder>, capacity: usize) -> Self {
        Self {
            shared: Mutex::new(TxShared {
                output: None,
                encoder,
                tx_buf: BytesMut::with_capacity(capacity),
                next_id: 0,
                last_sent: Instant::now(),
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TxShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the transmit gate of a freshly connected transport.
    pub(crate) fn install(&self, output: Box<dyn OutputGate>) {
        let mut shared = self.lock();
        shared.last_sent = Instant::now();
        shared.output = Some(output);
    }

    /// Detach and abort the current transmit gate, if any.
    pub(crate) fn release(&self) {
        let mut shared = self.lock();
        if let Some(mut output) = shared.output.take() {
            output.shutdown();
        }
    }

    /// Allocate the next message identifier. Wraps around, never yields zero.
    pub(crate) fn next_message_id(&self) -> MessageId {
        let mut shared = self.lock();
        shared.next_id = shared.next_id.checked_add(1).unwrap_or(1);
        shared.next_id
    }

    /// Encode `request` and write it to the broker in one locked section.
    pub(crate) fn send(&self, request: &ProtocolRequest) -> Result<(), SessionError> {
        let mut shared = self.lock();
        let TxShared {
            output,
            encoder,
            tx_buf,
            last_sent,
            ..
        } = &mut *shared;
        let Some(output) = output.as_mut() else {
            return Err(SessionError::NotConnected);
        };
        tx_buf.clear();
        encoder.encode(request, tx_buf)?;
        if tx_buf.len() > self.capacity {
            // The rejected encode grew the buffer; restore the fixed region.
            *tx_buf = BytesMut::with_capacity(self.capacity);
            return Err(CodecError::BufferOverflow {
                capacity: self.capacity,
            }
            .into());
        }
        output.send_all(&tx_buf[..])?;
        *last_sent = Instant::now();
        Ok(())
    }

    /// True when nothing has been sent for `interval` on a live link.
    pub(crate) fn keep_alive_due(&self, interval: Duration) -> bool {
        let shared = self.lock();
        shared.output.is_some() && shared.last_sent.elapsed() >= interval
    }

    /// Time left until the next keep-alive is due, `None` without a link.
    pub(crate) fn next_keep_alive_in(&self, interval: Duration) -> Option<Duration> {
        let shared = self.lock();
        shared.output.as_ref()?;
        Some(interval.saturating_sub(shared.last_sent.elapsed()))
    }
}

struct Worker {
    join: JoinHandle<()>,
    stop_tx: Sender<()>,
}

/// A device-side MQTT session.
///
/// Construct with [`MqttSession::new`], register topic handlers in a
/// [`TopicRegistry`], then call [`MqttSession::start`] to spawn the
/// processing thread. Publish and subscribe calls are accepted from any
/// thread once the session reports [`LinkState::Connected`].
pub struct MqttSession {
    options: SessionOptions,
    state: Arc<StateCell>,
    tx: Arc<TxLink>,
    worker: Option<Worker>,
}

impl MqttSession {
    pub fn new(
        options: SessionOptions,
        encoder: Box<dyn RequestEncoder>,
    ) -> Result<Self, SessionError> {
        options.validate()?;
        let tx = Arc::new(TxLink::new(encoder, options.buffer_capacity));
        Ok(Self {
            options,
            state: Arc::new(StateCell::new()),
            tx,
            worker: None,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Current connection state. Cheap enough for polling.
    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    /// Spawn the processing thread.
    ///
    /// The thread owns the connector, decoder and topic registry for the
    /// lifetime of the session; it connects, reconnects and services inbound
    /// traffic until [`MqttSession::stop`] or drop.
    pub fn start(
        &mut self,
        connector: Box<dyn TransportConnector>,
        decoder: Box<dyn EventDecoder>,
        registry: TopicRegistry,
    ) -> Result<(), SessionError> {
        if self.worker.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let handler = EventHandler::new(
            self.state.clone(),
            self.tx.clone(),
            DispatchRouter::new(registry),
        );
        let mut processing = ProcessingLoop {
            connector,
            decoder,
            input: None,
            rx_buf: BytesMut::with_capacity(self.options.buffer_capacity),
            handler,
            tx: self.tx.clone(),
            state: self.state.clone(),
            stop: stop_rx,
            policy: self.options.retry.clone(),
            client_id: self.options.client_id.clone(),
            keep_alive: self.options.keep_alive,
        };

        let join = thread::Builder::new()
            .name(format!("mqtt-session-{}", self.options.client_id))
            .spawn(move || processing.run())
            .map_err(SessionError::Spawn)?;
        self.worker = Some(Worker { join, stop_tx });
        info!(client_id = %self.options.client_id, "session processing thread started");
        Ok(())
    }

    /// Signal the processing thread to stop and wait for it to exit.
    ///
    /// Idempotent. The transmit gate is aborted so a loop blocked on input
    /// readiness wakes up promptly instead of riding out its timeout.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        debug!(client_id = %self.options.client_id, "stopping session");
        drop(worker.stop_tx);
        self.tx.release();
        if worker.join.join().is_err() {
            warn!("session processing thread panicked");
        }
        self.state.set(LinkState::Disconnected);
    }

    /// Publish `payload` on `topic`.
    ///
    /// QoS 1 and 2 publications are assigned a fresh message identifier; the
    /// acknowledgment handshake completes asynchronously on the processing
    /// thread. A broker NACK is logged there, never surfaced here.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        if topic.is_empty() {
            return Err(SessionError::InvalidArgument("topic must not be empty"));
        }
        if self.state.get() != LinkState::Connected {
            return Err(SessionError::NotConnected);
        }
        let message_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.tx.next_message_id()),
        };
        self.tx.send(&ProtocolRequest::Publish {
            topic: topic.to_owned(),
            qos,
            retain,
            message_id,
            payload: payload.to_vec(),
        })
    }

    /// Subscribe to `topic`.
    ///
    /// When `seed` is given it is published first as a retained QoS 0
    /// message, so the retained value exists before the subscription that
    /// will deliver it back.
    pub fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        seed: Option<&[u8]>,
    ) -> Result<(), SessionError> {
        if topic.is_empty() {
            return Err(SessionError::InvalidArgument("topic must not be empty"));
        }
        if self.state.get() != LinkState::Connected {
            return Err(SessionError::NotConnected);
        }
        if let Some(seed) = seed {
            self.tx.send(&ProtocolRequest::Publish {
                topic: topic.to_owned(),
                qos: QoS::AtMostOnce,
                retain: true,
                message_id: None,
                payload: seed.to_vec(),
            })?;
        }
        self.tx.send(&ProtocolRequest::Subscribe {
            topic: topic.to_owned(),
            qos,
            message_id: self.tx.next_message_id(),
        })
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.stop();
    }
}
