//! Test doubles for the transport and codec boundaries.
//!
//! Everything here is deterministic and in-process: scripted connectors
//! stand in for the network, scripted codecs stand in for a real packet
//! implementation. Tests drive the session by pushing decoded events onto a
//! shared [`ScriptHandle`] and asserting on the requests the session encodes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::codec::{
    CodecError, EventDecoder, EventSink, MessageId, PayloadChannel, ProtocolEvent,
    ProtocolRequest, PublishEvent, QoS, RequestEncoder,
};
use crate::transport::{
    InputGate, OutputGate, Readiness, RecvOutcome, TransportConnector, TransportError,
};

/// An input gate that serves canned byte chunks, one `recv` per chunk.
pub struct ChunkedInputGate {
    chunks: VecDeque<Vec<u8>>,
    closed_when_empty: bool,
}

impl ChunkedInputGate {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            closed_when_empty: false,
        }
    }

    /// Like [`ChunkedInputGate::new`], but the stream reports `Closed` once
    /// the chunks run out.
    pub fn closed_after(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: chunks.into(),
            closed_when_empty: true,
        }
    }
}

impl InputGate for ChunkedInputGate {
    fn poll_readable(&mut self, _timeout: Duration) -> Result<Readiness, TransportError> {
        Ok(Readiness::Readable)
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, TransportError> {
        let Some(chunk) = self.chunks.front_mut() else {
            return Ok(if self.closed_when_empty {
                RecvOutcome::Closed
            } else {
                RecvOutcome::WouldBlock
            });
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            self.chunks.pop_front();
        }
        Ok(RecvOutcome::Data(n))
    }
}

/// Records every request it is asked to encode and writes placeholder bytes.
#[derive(Default, Clone)]
pub struct RecordingEncoder {
    requests: Arc<Mutex<Vec<ProtocolRequest>>>,
}

impl RecordingEncoder {
    /// Drain and return everything encoded so far.
    pub fn take(&self) -> Vec<ProtocolRequest> {
        std::mem::take(&mut self.requests.lock().unwrap())
    }
}

impl RequestEncoder for RecordingEncoder {
    fn encode(&mut self, request: &ProtocolRequest, tx: &mut BytesMut) -> Result<(), CodecError> {
        self.requests.lock().unwrap().push(request.clone());
        match request {
            ProtocolRequest::Publish { topic, payload, .. } => {
                tx.extend_from_slice(topic.as_bytes());
                tx.extend_from_slice(payload);
            }
            _ => tx.extend_from_slice(&[0u8; 2]),
        }
        Ok(())
    }
}

/// An output gate that counts writes and shutdowns.
#[derive(Default)]
pub struct CountingOutputGate {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
    pub shutdowns: Arc<AtomicU32>,
}

impl OutputGate for CountingOutputGate {
    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// One batch per decode pass: each entry is a decoded event plus the payload
/// bytes the decoder would have pulled off the wire for it.
type EventBatch = Vec<(ProtocolEvent, Vec<u8>)>;

/// Shared queue of scripted event batches, pushed by tests and popped by a
/// [`ScriptedDecoder`] on the processing thread.
#[derive(Default, Clone)]
pub struct ScriptHandle {
    batches: Arc<Mutex<VecDeque<EventBatch>>>,
}

impl ScriptHandle {
    pub fn push_batch(&self, batch: EventBatch) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn push_event(&self, event: ProtocolEvent) {
        self.push_batch(vec![(event, Vec::new())]);
    }

    pub fn push_publish(
        &self,
        topic: &str,
        qos: QoS,
        message_id: Option<MessageId>,
        payload: &[u8],
    ) {
        self.push_batch(vec![(
            ProtocolEvent::Publish(PublishEvent {
                message_id,
                topic: topic.into(),
                qos,
                payload_len: payload.len(),
            }),
            payload.to_vec(),
        )]);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().unwrap().is_empty()
    }

    fn pop(&self) -> Option<EventBatch> {
        self.batches.lock().unwrap().pop_front()
    }
}

/// Records requests like [`RecordingEncoder`] and additionally answers every
/// CONNECT (after `silent_connects` unanswered ones) by scripting a
/// successful CONNACK, closing the connect handshake loop.
pub struct ScriptedEncoder {
    script: ScriptHandle,
    requests: Arc<Mutex<Vec<ProtocolRequest>>>,
    silent_connects: u32,
    connects_seen: u32,
}

impl ScriptedEncoder {
    pub fn new(script: ScriptHandle, silent_connects: u32) -> Self {
        Self {
            script,
            requests: Arc::default(),
            silent_connects,
            connects_seen: 0,
        }
    }

    /// Shared handle to the recorded request log.
    pub fn requests(&self) -> Arc<Mutex<Vec<ProtocolRequest>>> {
        self.requests.clone()
    }
}

impl RequestEncoder for ScriptedEncoder {
    fn encode(&mut self, request: &ProtocolRequest, tx: &mut BytesMut) -> Result<(), CodecError> {
        self.requests.lock().unwrap().push(request.clone());
        tx.extend_from_slice(&[0u8; 2]);
        if matches!(request, ProtocolRequest::Connect { .. }) {
            self.connects_seen += 1;
            if self.connects_seen > self.silent_connects {
                self.script.push_event(ProtocolEvent::ConnAck { result: Ok(()) });
            }
        }
        Ok(())
    }
}

/// Input gate whose readiness tracks the script queue.
pub struct ScriptedInputGate {
    script: ScriptHandle,
}

impl InputGate for ScriptedInputGate {
    fn poll_readable(&mut self, timeout: Duration) -> Result<Readiness, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.script.is_empty() {
                return Ok(Readiness::Readable);
            }
            if Instant::now() >= deadline {
                return Ok(Readiness::TimedOut);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn recv(&mut self, _buf: &mut [u8]) -> Result<RecvOutcome, TransportError> {
        // Payload bytes are delivered through the decoder's receive buffer.
        Ok(RecvOutcome::WouldBlock)
    }
}

/// Decoder that replays scripted event batches instead of parsing bytes.
///
/// Payload bytes are staged in the receive buffer so the payload channel
/// behaves exactly as it would after a real decode pass. Any bytes a handler
/// failed to consume are tallied in the `undrained` counter.
pub struct ScriptedDecoder {
    script: ScriptHandle,
    undrained: Arc<AtomicUsize>,
}

impl ScriptedDecoder {
    pub fn new(script: ScriptHandle) -> Self {
        Self {
            script,
            undrained: Arc::default(),
        }
    }

    /// Shared counter of payload bytes left unconsumed by event handling.
    pub fn undrained(&self) -> Arc<AtomicUsize> {
        self.undrained.clone()
    }
}

impl EventDecoder for ScriptedDecoder {
    fn process_input(
        &mut self,
        input: &mut dyn InputGate,
        rx: &mut BytesMut,
        sink: &mut dyn EventSink,
    ) -> Result<(), CodecError> {
        let Some(batch) = self.script.pop() else {
            return Ok(());
        };
        for (event, payload) in batch {
            rx.clear();
            rx.extend_from_slice(&payload);
            let mut channel = PayloadChannel::new(rx, input, payload.len());
            sink.on_event(&mut channel, event)?;
            self.undrained
                .fetch_add(channel.remaining(), Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Connector that refuses a scripted number of attempts, then hands out
/// scripted gates. Counts connects and transport shutdowns.
pub struct ScriptedConnector {
    script: ScriptHandle,
    refusals: u32,
    accept: bool,
    connects: Arc<AtomicU32>,
    shutdowns: Arc<AtomicU32>,
}

impl ScriptedConnector {
    /// Accept every attempt.
    pub fn accepting(script: ScriptHandle) -> Self {
        Self::flaky(script, 0)
    }

    /// Refuse every attempt.
    pub fn refusing(script: ScriptHandle) -> Self {
        Self {
            script,
            refusals: 0,
            accept: false,
            connects: Arc::default(),
            shutdowns: Arc::default(),
        }
    }

    /// Refuse the first `refusals` attempts, accept afterwards.
    pub fn flaky(script: ScriptHandle, refusals: u32) -> Self {
        Self {
            script,
            refusals,
            accept: true,
            connects: Arc::default(),
            shutdowns: Arc::default(),
        }
    }

    pub fn connects(&self) -> Arc<AtomicU32> {
        self.connects.clone()
    }

    pub fn shutdowns(&self) -> Arc<AtomicU32> {
        self.shutdowns.clone()
    }
}

impl TransportConnector for ScriptedConnector {
    fn connect(&mut self) -> Result<(Box<dyn InputGate>, Box<dyn OutputGate>), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refusals > 0 {
            self.refusals -= 1;
            return Err(TransportError::ConnectionFailed("scripted refusal".into()));
        }
        if !self.accept {
            return Err(TransportError::ConnectionFailed("scripted refusal".into()));
        }
        let input = ScriptedInputGate {
            script: self.script.clone(),
        };
        let output = CountingOutputGate {
            sent: Arc::default(),
            shutdowns: self.shutdowns.clone(),
        };
        Ok((Box::new(input), Box::new(output)))
    }
}
