//! Dispatch router
//!
//! Resolves an inbound publication to a registered handler by exact topic
//! match and guarantees the payload channel is left fully consumed no matter
//! what the handler does. An unconsumed payload would shift every subsequent
//! packet boundary, so draining here is a correctness requirement, not a
//! courtesy.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::codec::{PayloadChannel, ReadError};
use crate::transport::TransportError;

/// Topic names longer than this are truncated to the prefix before routing.
pub const MAX_TOPIC_LEN: usize = 128;

/// Returned by a handler that declines a publication. The payload is drained
/// and the QoS acknowledgment is still sent; this is not a session error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection(pub &'static str);

/// What a registered handler sees for the publish event currently being
/// dispatched. Payload access is only valid inside the callback; the borrow
/// makes escaping it impossible.
pub struct DispatchContext<'a, 'b> {
    topic: &'a str,
    total: usize,
    payload: &'a mut PayloadChannel<'b>,
}

impl DispatchContext<'_, '_> {
    /// The (possibly truncated) topic the publication arrived on.
    pub fn topic(&self) -> &str {
        self.topic
    }

    /// Total payload length announced by the publish packet.
    pub fn payload_len(&self) -> usize {
        self.total
    }

    /// Payload bytes not yet read by this callback.
    pub fn remaining(&self) -> usize {
        self.payload.remaining()
    }

    /// Read exactly `buf.len()` payload bytes, blocking until they arrive or
    /// the transport fails.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<(), ReadError> {
        self.payload.read_exact(buf)
    }
}

pub type TopicHandler =
    Box<dyn FnMut(&mut DispatchContext<'_, '_>) -> Result<(), Rejection> + Send>;

/// Maps exact topic strings to handler closures.
///
/// Routing is a router responsibility: handlers are registered per topic
/// instead of one application callback doing its own string comparison. The
/// optional fallback slot catches everything without an exact match.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: BTreeMap<String, TopicHandler>,
    fallback: Option<TopicHandler>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact topic. Replaces any previous handler
    /// for the same topic.
    pub fn on<F>(&mut self, topic: impl Into<String>, handler: F) -> &mut Self
    where
        F: FnMut(&mut DispatchContext<'_, '_>) -> Result<(), Rejection> + Send + 'static,
    {
        self.handlers.insert(topic.into(), Box::new(handler));
        self
    }

    /// Register a catch-all handler for topics without an exact match.
    pub fn fallback<F>(&mut self, handler: F) -> &mut Self
    where
        F: FnMut(&mut DispatchContext<'_, '_>) -> Result<(), Rejection> + Send + 'static,
    {
        self.fallback = Some(Box::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }

    fn resolve(&mut self, topic: &str) -> Option<&mut TopicHandler> {
        if let Some(handler) = self.handlers.get_mut(topic) {
            return Some(handler);
        }
        self.fallback.as_mut()
    }
}

enum Outcome {
    Handled,
    Rejected,
    Unhandled,
}

/// Routes inbound publications to the registry and polices payload
/// consumption.
pub(crate) struct DispatchRouter {
    registry: TopicRegistry,
}

impl DispatchRouter {
    pub(crate) fn new(registry: TopicRegistry) -> Self {
        Self { registry }
    }

    /// Dispatch one publication. On return the payload channel is empty;
    /// only a transport failure escapes.
    pub(crate) fn on_publish(
        &mut self,
        payload: &mut PayloadChannel<'_>,
        topic: &str,
        payload_len: usize,
    ) -> Result<(), TransportError> {
        let topic = truncate_topic(topic);

        let outcome = match self.registry.resolve(topic) {
            None => {
                debug!(topic, "no handler registered for topic");
                Outcome::Unhandled
            }
            Some(handler) => {
                let mut ctx = DispatchContext {
                    topic,
                    total: payload_len,
                    payload,
                };
                match handler(&mut ctx) {
                    Ok(()) => Outcome::Handled,
                    Err(Rejection(reason)) => {
                        warn!(topic, reason, "handler rejected publication");
                        Outcome::Rejected
                    }
                }
            }
        };

        let leftover = payload.drain()?;
        match outcome {
            Outcome::Handled if leftover > 0 => {
                warn!(topic, leftover, "handler left payload bytes unread; drained");
            }
            Outcome::Rejected | Outcome::Unhandled => {
                debug!(topic, drained = leftover, "payload drained");
            }
            Outcome::Handled => {}
        }
        Ok(())
    }
}

/// Clamp an oversized topic name to its prefix, respecting char boundaries.
fn truncate_topic(topic: &str) -> &str {
    if topic.len() <= MAX_TOPIC_LEN {
        return topic;
    }
    let mut end = MAX_TOPIC_LEN;
    while !topic.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        len = topic.len(),
        max = MAX_TOPIC_LEN,
        "truncating oversized topic name"
    );
    &topic[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChunkedInputGate;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dispatch(
        router: &mut DispatchRouter,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut buffered = BytesMut::from(payload);
        let mut gate = ChunkedInputGate::new(Vec::new());
        let mut channel = PayloadChannel::new(&mut buffered, &mut gate, payload.len());
        let result = router.on_publish(&mut channel, topic, payload.len());
        assert_eq!(channel.remaining(), 0, "payload channel left unconsumed");
        result
    }

    #[test]
    fn unhandled_topic_is_fully_drained() {
        let mut router = DispatchRouter::new(TopicRegistry::new());
        dispatch(&mut router, "unknown/topic", &[0u8; 10]).unwrap();
    }

    #[test]
    fn rejected_publication_is_fully_drained() {
        let mut registry = TopicRegistry::new();
        registry.on("dev/pcu/out", |_ctx| Err(Rejection("nope")));
        let mut router = DispatchRouter::new(registry);
        dispatch(&mut router, "dev/pcu/out", b"payload").unwrap();
    }

    #[test]
    fn successful_handler_reads_its_own_payload() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = seen.clone();

        let mut registry = TopicRegistry::new();
        registry.on("dev/pcu/out", move |ctx| {
            assert_eq!(ctx.payload_len(), 1);
            let mut b = [0u8; 1];
            ctx.read_payload(&mut b).map_err(|_| Rejection("read"))?;
            seen_in.store(b[0] as usize, Ordering::SeqCst);
            Ok(())
        });
        let mut router = DispatchRouter::new(registry);
        dispatch(&mut router, "dev/pcu/out", b"1").unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), b'1' as usize);
    }

    #[test]
    fn partial_handler_read_does_not_desynchronize() {
        let mut registry = TopicRegistry::new();
        registry.on("dev/pcu/out", |ctx| {
            let mut b = [0u8; 2];
            ctx.read_payload(&mut b).map_err(|_| Rejection("read"))?;
            Ok(()) // leaves the rest unread
        });
        let mut router = DispatchRouter::new(registry);
        dispatch(&mut router, "dev/pcu/out", b"0123456789").unwrap();
    }

    #[test]
    fn oversized_topic_routes_by_truncated_prefix() {
        let long_topic = "t/".repeat(100); // 200 bytes
        let prefix = &long_topic[..MAX_TOPIC_LEN];

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        let mut registry = TopicRegistry::new();
        registry.on(prefix, move |_ctx| {
            hits_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut router = DispatchRouter::new(registry);
        dispatch(&mut router, &long_topic, &[]).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn truncation_lands_on_a_char_boundary() {
        let long_topic = format!("{}é", "x".repeat(MAX_TOPIC_LEN - 1)); // é straddles the limit
        let truncated = truncate_topic(&long_topic);
        assert_eq!(truncated.len(), MAX_TOPIC_LEN - 1);
        assert!(long_topic.is_char_boundary(truncated.len()));
    }

    #[test]
    fn fallback_handler_catches_unmatched_topics() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        let mut registry = TopicRegistry::new();
        registry.fallback(move |ctx| {
            assert_eq!(ctx.topic(), "anything/else");
            hits_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut router = DispatchRouter::new(registry);
        dispatch(&mut router, "anything/else", b"x").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
