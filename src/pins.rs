//! GPIO pin integration
//!
//! Input pin edges are forwarded to the broker through a bounded queue and a
//! pump thread, never published from the notification context itself. When
//! the queue is full the event is dropped and counted; the pump catches up
//! with the latest state on its own. Output pins are driven by inbound
//! publications through a registered topic handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::codec::QoS;
use crate::session::{MqttSession, Rejection, SessionError, TopicRegistry};

/// One observed input pin edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinEvent {
    pub pin: u8,
    pub value: bool,
}

/// Create the bounded queue between pin notification sites and the pump.
pub fn pin_event_queue(capacity: usize) -> (PinEventSender, Receiver<PinEvent>) {
    let (tx, rx) = bounded(capacity);
    (
        PinEventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Non-blocking producer side of the pin event queue. Cheap to clone, safe
/// to call from any notification context.
#[derive(Clone)]
pub struct PinEventSender {
    tx: Sender<PinEvent>,
    dropped: Arc<AtomicU64>,
}

impl PinEventSender {
    /// Enqueue an edge. Never blocks: a full queue drops the event and bumps
    /// the drop counter.
    pub fn notify(&self, pin: u8, value: bool) {
        match self.tx.try_send(PinEvent { pin, value }) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(pin = event.pin, "pin event queue full; event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Total events dropped because the queue was full or the pump was gone.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Publication settings for pin state messages.
#[derive(Debug, Clone, Copy)]
pub struct PinPumpOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PinPumpOptions {
    fn default() -> Self {
        // Retained so a late subscriber sees the current pin state.
        Self {
            qos: QoS::AtLeastOnce,
            retain: true,
        }
    }
}

/// Thread that drains the pin event queue and publishes each edge as `"1"`
/// or `"0"` on the topic mapped to its pin.
pub struct PinEventPump {
    join: JoinHandle<()>,
}

impl PinEventPump {
    /// Spawn the pump. It runs until every [`PinEventSender`] clone has been
    /// dropped, then exits on its own.
    pub fn spawn(
        session: Arc<MqttSession>,
        events: Receiver<PinEvent>,
        topics: HashMap<u8, String>,
        options: PinPumpOptions,
    ) -> Result<Self, SessionError> {
        let join = thread::Builder::new()
            .name("pin-event-pump".into())
            .spawn(move || pump(session, events, topics, options))
            .map_err(SessionError::Spawn)?;
        Ok(Self { join })
    }

    /// Wait for the pump thread to exit.
    pub fn join(self) {
        if self.join.join().is_err() {
            warn!("pin event pump thread panicked");
        }
    }
}

fn pump(
    session: Arc<MqttSession>,
    events: Receiver<PinEvent>,
    topics: HashMap<u8, String>,
    options: PinPumpOptions,
) {
    for event in events.iter() {
        let Some(topic) = topics.get(&event.pin) else {
            debug!(pin = event.pin, "no topic mapped for pin; event ignored");
            continue;
        };
        let payload: &[u8] = if event.value { b"1" } else { b"0" };
        match session.publish(topic, options.qos, options.retain, payload) {
            Ok(()) => {}
            Err(SessionError::NotConnected) => {
                debug!(pin = event.pin, %topic, "not connected; pin state not published");
            }
            Err(err) => {
                warn!(pin = event.pin, %topic, %err, "pin state publish failed");
            }
        }
    }
    debug!("pin event pump exiting");
}

/// An output a topic handler can drive.
pub trait OutputPin: Send {
    fn set(&mut self, value: bool);
}

/// Register a handler that drives `pin` from single-byte `'0'`/`'1'`
/// publications on `topic`. Anything else is rejected and the publication
/// dropped.
pub fn register_output_pin(
    registry: &mut TopicRegistry,
    topic: impl Into<String>,
    mut pin: impl OutputPin + 'static,
) {
    registry.on(topic, move |ctx| {
        if ctx.payload_len() != 1 {
            return Err(Rejection("output pin payload must be exactly one byte"));
        }
        let mut level = [0u8; 1];
        ctx.read_payload(&mut level)
            .map_err(|_| Rejection("output pin payload read failed"))?;
        match level[0] {
            b'0' => pin.set(false),
            b'1' => pin.set(true),
            _ => return Err(Rejection("output pin payload must be '0' or '1'")),
        }
        Ok(())
    });
}
