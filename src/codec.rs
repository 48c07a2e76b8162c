// SPDX-License-Identifier: MPL-2.0

//! Protocol codec boundary
//!
//! The session core does not carry an MQTT packet implementation. It speaks
//! to an external encoder/decoder through the types in this module: typed
//! outgoing [`ProtocolRequest`]s, typed decoded [`ProtocolEvent`]s, and a
//! [`PayloadChannel`] that streams an inbound publish payload out of the
//! transport without buffering it whole.
//!
//! The decoder contract mirrors a `process pending input` call: decode every
//! complete packet currently available, invoke the sink exactly once per
//! event, synchronously, and rely on the sink to leave the payload channel
//! fully consumed so the stream stays aligned on a packet boundary.

use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::transport::{InputGate, RecvOutcome, TransportError};

/// Bounded wait used while a payload read or drain sits on an empty stream.
/// A timeout here just re-arms the wait; only a transport error gives up.
const PAYLOAD_WAIT: Duration = Duration::from_secs(1);

/// Chunk size for draining unread payload bytes.
const DRAIN_CHUNK: usize = 64;

/// MQTT message identifier. Zero is never allocated.
pub type MessageId = u16;

/// Broker-reported outcome attached to a decoded acknowledgment.
pub type EventResult = Result<(), i32>;

/// Delivery guarantee level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level: {other}")),
        }
    }
}

/// An inbound publication, decoded up to (but not including) its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEvent {
    pub message_id: Option<MessageId>,
    pub topic: String,
    pub qos: QoS,
    pub payload_len: usize,
}

/// Events decoded from the broker stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    ConnAck { result: EventResult },
    Disconnect { reason: Option<u8> },
    Publish(PublishEvent),
    PubAck { message_id: MessageId, result: EventResult },
    PubRec { message_id: MessageId, result: EventResult },
    PubRel { message_id: MessageId, result: EventResult },
    PubComp { message_id: MessageId, result: EventResult },
    SubAck { message_id: MessageId, result: EventResult },
    UnsubAck { message_id: MessageId, result: EventResult },
    PingResp,
}

/// Requests the session hands to the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolRequest {
    Connect {
        client_id: String,
        keep_alive: Duration,
        clean_session: bool,
    },
    Publish {
        topic: String,
        qos: QoS,
        retain: bool,
        message_id: Option<MessageId>,
        payload: Vec<u8>,
    },
    Subscribe {
        topic: String,
        qos: QoS,
        message_id: MessageId,
    },
    PubAck { message_id: MessageId },
    PubRec { message_id: MessageId },
    PubRel { message_id: MessageId },
    PubComp { message_id: MessageId },
    PingReq,
    Disconnect,
}

/// Raised by an event sink when the link must be dropped.
#[derive(Debug, thiserror::Error)]
#[error("link failed while {context}: {source}")]
pub struct LinkFailure {
    pub context: &'static str,
    #[source]
    pub source: TransportError,
}

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("transport failure on the protocol stream: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Link(#[from] LinkFailure),

    #[error("malformed {kind} packet: {detail}")]
    Malformed { kind: &'static str, detail: String },

    #[error("encoded packet does not fit the transmit buffer ({capacity} bytes)")]
    BufferOverflow { capacity: usize },
}

/// Error type for payload reads from inside a dispatch callback.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("requested {requested} bytes but only {remaining} remain in the payload")]
    BeyondPayload { requested: usize, remaining: usize },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Encodes one request into the session's transmit buffer.
///
/// The buffer is exclusively borrowed for the duration of the call and
/// returned to the session afterwards; no other encode may alias it.
pub trait RequestEncoder: Send {
    fn encode(&mut self, request: &ProtocolRequest, tx: &mut BytesMut) -> Result<(), CodecError>;
}

/// Decodes pending input into events.
pub trait EventDecoder: Send {
    /// Decode every complete packet currently pending on `input`, invoking
    /// `sink` exactly once per event before returning. `rx` is the session's
    /// receive buffer, exclusively borrowed for the pass. For publish events
    /// the sink receives a [`PayloadChannel`] positioned over the unread
    /// payload bytes; for everything else the channel is empty.
    fn process_input(
        &mut self,
        input: &mut dyn InputGate,
        rx: &mut BytesMut,
        sink: &mut dyn EventSink,
    ) -> Result<(), CodecError>;
}

/// Consumer of decoded events; implemented by the session's event handler.
pub trait EventSink {
    fn on_event(
        &mut self,
        payload: &mut PayloadChannel<'_>,
        event: ProtocolEvent,
    ) -> Result<(), LinkFailure>;
}

/// Read access to the pending payload of the publish event currently being
/// dispatched.
///
/// Bytes the decoder already pulled off the wire are served from `buffered`
/// first; the rest is streamed from the transport. The channel tracks how
/// many payload bytes remain so reads can never cross into the next packet.
pub struct PayloadChannel<'a> {
    buffered: &'a mut BytesMut,
    input: &'a mut dyn InputGate,
    remaining: usize,
}

impl<'a> PayloadChannel<'a> {
    pub fn new(buffered: &'a mut BytesMut, input: &'a mut dyn InputGate, len: usize) -> Self {
        Self {
            buffered,
            input,
            remaining: len,
        }
    }

    /// Payload bytes not yet read through this channel.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Read whatever is available, capped at the payload boundary.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, TransportError> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(RecvOutcome::Data(0));
        }
        let want = buf.len().min(self.remaining);
        if !self.buffered.is_empty() {
            let n = want.min(self.buffered.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.advance(n);
            self.remaining -= n;
            return Ok(RecvOutcome::Data(n));
        }
        match self.input.recv(&mut buf[..want])? {
            RecvOutcome::Data(n) => {
                self.remaining -= n;
                Ok(RecvOutcome::Data(n))
            }
            other => Ok(other),
        }
    }

    /// Fill `buf` completely, blocking the processing thread until the bytes
    /// arrive or the transport fails.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        if buf.len() > self.remaining {
            return Err(ReadError::BeyondPayload {
                requested: buf.len(),
                remaining: self.remaining,
            });
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..])? {
                RecvOutcome::Data(0) | RecvOutcome::WouldBlock => self.wait_readable()?,
                RecvOutcome::Data(n) => filled += n,
                RecvOutcome::Closed => {
                    return Err(ReadError::Transport(TransportError::Closed))
                }
            }
        }
        Ok(())
    }

    /// Discard every remaining payload byte, in bounded chunks.
    ///
    /// Returns the number of bytes discarded. A `WouldBlock` read is not an
    /// error: the channel waits for readiness and keeps going until the
    /// payload boundary is reached, so the decoder never desynchronizes.
    pub fn drain(&mut self) -> Result<usize, TransportError> {
        let mut drained = 0usize;
        let mut chunk = [0u8; DRAIN_CHUNK];
        while self.remaining > 0 {
            let want = DRAIN_CHUNK.min(self.remaining);
            match self.read(&mut chunk[..want])? {
                RecvOutcome::Data(0) | RecvOutcome::WouldBlock => self.wait_readable()?,
                RecvOutcome::Data(n) => drained += n,
                RecvOutcome::Closed => return Err(TransportError::Closed),
            }
        }
        Ok(drained)
    }

    fn wait_readable(&mut self) -> Result<(), TransportError> {
        self.input.poll_readable(PAYLOAD_WAIT).map(|_| ())
    }
}
