//! Protocol event handling
//!
//! One decoded event in, at most one acknowledgment out. The handler owns the
//! QoS handshake table:
//!
//! * inbound QoS 1 publish: dispatch, then PUBACK
//! * inbound QoS 2 publish: dispatch, then PUBREC; the broker's PUBREL is
//!   answered with PUBCOMP
//! * outbound QoS 2 publish: the broker's PUBREC is answered with PUBREL
//!
//! Every reply carries the message identifier of the packet it acknowledges.
//! Broker NACKs are logged and swallowed; only a failure to read or write the
//! link escapes as a [`LinkFailure`].

use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{
    EventSink, LinkFailure, PayloadChannel, ProtocolEvent, ProtocolRequest, PublishEvent, QoS,
};
use crate::transport::TransportError;

use super::{DispatchRouter, LinkState, StateCell, TxLink};

pub(crate) struct EventHandler {
    state: Arc<StateCell>,
    tx: Arc<TxLink>,
    router: DispatchRouter,
}

impl EventHandler {
    pub(crate) fn new(state: Arc<StateCell>, tx: Arc<TxLink>, router: DispatchRouter) -> Self {
        Self { state, tx, router }
    }

    fn reply(&self, context: &'static str, request: ProtocolRequest) -> Result<(), LinkFailure> {
        if let Err(err) = self.tx.send(&request) {
            let detail = err.to_string();
            let source = err
                .into_transport()
                .unwrap_or_else(|| TransportError::Io(io::Error::other(detail)));
            return Err(LinkFailure { context, source });
        }
        Ok(())
    }

    fn on_publish(
        &mut self,
        payload: &mut PayloadChannel<'_>,
        event: PublishEvent,
    ) -> Result<(), LinkFailure> {
        let message_id = match (event.qos, event.message_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => {
                // A QoS 1/2 publish without an identifier cannot be
                // acknowledged. Drop it, but keep the stream aligned.
                warn!(
                    topic = %event.topic,
                    qos = ?event.qos,
                    "publish carries no message id; dropping"
                );
                payload.drain().map_err(|source| LinkFailure {
                    context: "draining an unacknowledgeable publish",
                    source,
                })?;
                return Ok(());
            }
        };

        self.router
            .on_publish(payload, &event.topic, event.payload_len)
            .map_err(|source| LinkFailure {
                context: "dispatching an inbound publish",
                source,
            })?;

        match (event.qos, message_id) {
            (QoS::AtLeastOnce, Some(message_id)) => {
                self.reply("acknowledging a QoS 1 publish", ProtocolRequest::PubAck {
                    message_id,
                })
            }
            (QoS::ExactlyOnce, Some(message_id)) => {
                self.reply("acknowledging a QoS 2 publish", ProtocolRequest::PubRec {
                    message_id,
                })
            }
            _ => Ok(()),
        }
    }
}

impl EventSink for EventHandler {
    fn on_event(
        &mut self,
        payload: &mut PayloadChannel<'_>,
        event: ProtocolEvent,
    ) -> Result<(), LinkFailure> {
        match event {
            ProtocolEvent::ConnAck { result: Ok(()) } => {
                info!("broker accepted the connection");
                self.state.set(LinkState::Connected);
                Ok(())
            }
            ProtocolEvent::ConnAck { result: Err(code) } => {
                warn!(code, "broker refused the connection");
                Ok(())
            }
            ProtocolEvent::Disconnect { reason } => {
                info!(?reason, "broker closed the session");
                self.state.set(LinkState::Disconnected);
                Ok(())
            }
            ProtocolEvent::Publish(event) => self.on_publish(payload, event),
            ProtocolEvent::PubAck { message_id, result } => {
                match result {
                    Ok(()) => debug!(message_id, "QoS 1 publish acknowledged"),
                    Err(code) => warn!(message_id, code, "QoS 1 publish rejected by broker"),
                }
                Ok(())
            }
            ProtocolEvent::PubRec { message_id, result } => match result {
                Ok(()) => self.reply(
                    "releasing a QoS 2 publish",
                    ProtocolRequest::PubRel { message_id },
                ),
                Err(code) => {
                    warn!(message_id, code, "QoS 2 publish rejected by broker");
                    Ok(())
                }
            },
            ProtocolEvent::PubRel { message_id, result } => match result {
                Ok(()) => self.reply(
                    "completing a QoS 2 delivery",
                    ProtocolRequest::PubComp { message_id },
                ),
                Err(code) => {
                    warn!(message_id, code, "broker flagged its own PUBREL");
                    Ok(())
                }
            },
            ProtocolEvent::PubComp { message_id, result } => {
                match result {
                    Ok(()) => debug!(message_id, "QoS 2 handshake complete"),
                    Err(code) => warn!(message_id, code, "QoS 2 completion rejected by broker"),
                }
                Ok(())
            }
            ProtocolEvent::SubAck { message_id, result } => {
                match result {
                    Ok(()) => debug!(message_id, "subscription acknowledged"),
                    Err(code) => warn!(message_id, code, "subscription rejected by broker"),
                }
                Ok(())
            }
            ProtocolEvent::UnsubAck { message_id, result } => {
                match result {
                    Ok(()) => debug!(message_id, "unsubscription acknowledged"),
                    Err(code) => warn!(message_id, code, "unsubscription rejected by broker"),
                }
                Ok(())
            }
            ProtocolEvent::PingResp => {
                debug!("keep-alive answered");
                Ok(())
            }
        }
    }
}
