//! Connection lifecycle
//!
//! The processing loop runs on the session's dedicated thread. Disconnected,
//! it runs bounded connect cycles separated by a cooldown; connected, it
//! waits for input, decodes whatever arrived and keeps the link alive. Every
//! suspension point doubles as a stop check so shutdown never waits on a full
//! timeout chain.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::{debug, info, warn};

use crate::codec::{EventDecoder, ProtocolRequest};
use crate::transport::{InputGate, Readiness, TransportConnector};

use super::error::{ConnectError, SessionError};
use super::events::EventHandler;
use super::{LinkState, StateCell, TxLink};

/// Reconnect timing knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Connect attempts per cycle before declaring the cycle exhausted.
    pub connect_attempts: u32,
    /// Pause between attempts within a cycle.
    pub retry_pause: Duration,
    /// Pause between exhausted cycles.
    pub cooldown: Duration,
    /// How long one attempt waits for the broker's CONNACK.
    pub connack_timeout: Duration,
    /// Input readiness wait per loop iteration while connected.
    pub input_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_attempts: 5,
            retry_pause: Duration::from_secs(1),
            cooldown: Duration::from_secs(30),
            connack_timeout: Duration::from_secs(10),
            input_timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) struct ProcessingLoop {
    pub(crate) connector: Box<dyn TransportConnector>,
    pub(crate) decoder: Box<dyn EventDecoder>,
    pub(crate) input: Option<Box<dyn InputGate>>,
    pub(crate) rx_buf: BytesMut,
    pub(crate) handler: EventHandler,
    pub(crate) tx: Arc<TxLink>,
    pub(crate) state: Arc<StateCell>,
    pub(crate) stop: Receiver<()>,
    pub(crate) policy: RetryPolicy,
    pub(crate) client_id: String,
    pub(crate) keep_alive: Duration,
}

impl ProcessingLoop {
    pub(crate) fn run(&mut self) {
        loop {
            if self.stopped() {
                break;
            }
            match self.state.get() {
                LinkState::Disconnected => match self.connect_cycle() {
                    Ok(()) => {}
                    Err(ConnectError::Stopped) => break,
                    Err(err @ ConnectError::ExhaustedRetries { .. }) => {
                        warn!(%err, cooldown = ?self.policy.cooldown, "cooling down");
                        if self.sleep_interruptible(self.policy.cooldown) {
                            break;
                        }
                    }
                },
                LinkState::Connected => {
                    if let Err(err) = self.tick() {
                        if err.is_link_failure() {
                            warn!(%err, "link failed; reconnecting");
                        } else {
                            warn!(%err, "unrecoverable protocol failure; reconnecting");
                        }
                        self.drop_link();
                    }
                }
            }
        }
        self.drop_link();
        debug!("session processing thread exiting");
    }

    /// One bounded cycle of connect attempts. Returns `Ok` only once the
    /// broker has accepted the connection.
    fn connect_cycle(&mut self) -> Result<(), ConnectError> {
        let attempts = self.policy.connect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.stopped() {
                return Err(ConnectError::Stopped);
            }
            match self.attempt_connect() {
                Ok(()) if self.state.get() == LinkState::Connected => {
                    info!(attempt, "session established");
                    return Ok(());
                }
                Ok(()) => debug!(attempt, "no CONNACK within the window"),
                Err(err) => warn!(attempt, %err, "connect attempt failed"),
            }
            // Abort whatever the failed attempt left half-open.
            self.drop_link();
            if attempt < attempts && self.sleep_interruptible(self.policy.retry_pause) {
                return Err(ConnectError::Stopped);
            }
        }
        Err(ConnectError::ExhaustedRetries { attempts })
    }

    /// Open the transport, send CONNECT and wait for the broker's answer.
    /// On success the event handler has already flipped the state cell.
    fn attempt_connect(&mut self) -> Result<(), SessionError> {
        let (input, output) = self.connector.connect()?;
        self.input = Some(input);
        self.tx.install(output);

        self.tx.send(&ProtocolRequest::Connect {
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
            clean_session: true,
        })?;

        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        match input.poll_readable(self.policy.connack_timeout)? {
            Readiness::TimedOut => Ok(()),
            Readiness::Readable => self.process_input(),
        }
    }

    /// One connected iteration: wait for input, decode it, keep alive.
    fn tick(&mut self) -> Result<(), SessionError> {
        // Never poll past the next keep-alive deadline, or an idle link with
        // a long input timeout would ping late.
        let wait = match self.tx.next_keep_alive_in(self.keep_alive) {
            Some(remaining) => self
                .policy
                .input_timeout
                .min(remaining.max(Duration::from_millis(1))),
            None => {
                // Transmit gate already released (shutdown in progress).
                self.drop_link();
                return Ok(());
            }
        };
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        if input.poll_readable(wait)? == Readiness::Readable {
            self.process_input()?;
        }

        if self.state.get() == LinkState::Disconnected {
            // The broker ended the session mid-stream.
            self.drop_link();
            return Ok(());
        }
        if self.tx.keep_alive_due(self.keep_alive) {
            self.tx.send(&ProtocolRequest::PingReq)?;
        }
        Ok(())
    }

    fn process_input(&mut self) -> Result<(), SessionError> {
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        self.decoder
            .process_input(input.as_mut(), &mut self.rx_buf, &mut self.handler)?;
        Ok(())
    }

    fn drop_link(&mut self) {
        self.input = None;
        self.tx.release();
        self.state.set(LinkState::Disconnected);
    }

    fn stopped(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(TryRecvError::Empty))
    }

    /// Sleep for `pause`, waking early on a stop signal. Returns true when
    /// the loop should exit.
    fn sleep_interruptible(&self, pause: Duration) -> bool {
        !matches!(self.stop.recv_timeout(pause), Err(RecvTimeoutError::Timeout))
    }
}
