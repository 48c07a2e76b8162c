// SPDX-License-Identifier: MPL-2.0

//! TCP transport gate
//!
//! The stock transport for a plain (non-TLS) broker connection. The connected
//! stream is split with `try_clone` so the receive half can live on the
//! processing thread while the transmit half sits behind the session's
//! transmit lock.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use super::{InputGate, OutputGate, Readiness, RecvOutcome, TransportConnector, TransportError};

/// Grace period for a receive call on a stream that was just reported
/// readable. Expiring it maps to `WouldBlock`, never to an error.
const RECV_GRACE: Duration = Duration::from_millis(20);

/// Connects `host:port` over plain TCP.
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl TransportConnector for TcpConnector {
    fn connect(&mut self) -> Result<(Box<dyn InputGate>, Box<dyn OutputGate>), TransportError> {
        let stream = TcpStream::connect(&self.endpoint).map_err(|e| {
            TransportError::ConnectionFailed(format!("{}: {}", self.endpoint, e))
        })?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok((
            Box::new(TcpInput { stream }),
            Box::new(TcpOutput { stream: writer }),
        ))
    }
}

fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

struct TcpInput {
    stream: TcpStream,
}

impl InputGate for TcpInput {
    fn poll_readable(&mut self, timeout: Duration) -> Result<Readiness, TransportError> {
        // A zero read timeout means "block forever" to the socket layer.
        let timeout = timeout.max(Duration::from_millis(1));
        self.stream.set_read_timeout(Some(timeout))?;
        let mut probe = [0u8; 1];
        // peek keeps the byte in the kernel buffer; EOF also reports readable
        // so the subsequent recv observes Closed.
        match self.stream.peek(&mut probe) {
            Ok(_) => Ok(Readiness::Readable),
            Err(e) if is_would_block(&e) => Ok(Readiness::TimedOut),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<RecvOutcome, TransportError> {
        self.stream.set_read_timeout(Some(RECV_GRACE))?;
        match self.stream.read(buf) {
            Ok(0) => Ok(RecvOutcome::Closed),
            Ok(n) => Ok(RecvOutcome::Data(n)),
            Err(e) if is_would_block(&e) => Ok(RecvOutcome::WouldBlock),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

struct TcpOutput {
    stream: TcpStream,
}

impl OutputGate for TcpOutput {
    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        Ok(self.stream.write_all(bytes)?)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn local_pair() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        (listener, addr)
    }

    #[test]
    fn connect_refused_reports_connection_failed() {
        // Bind and drop a listener to find a port that is very likely closed.
        let (listener, addr) = local_pair();
        drop(listener);

        let mut connector = TcpConnector::new(addr);
        match connector.connect() {
            Err(TransportError::ConnectionFailed(_)) => {}
            Err(other) => panic!("expected ConnectionFailed, got {other:?}"),
            Ok(_) => panic!("expected ConnectionFailed, got Ok(..)"),
        }
    }

    #[test]
    fn poll_times_out_on_silent_peer() {
        let (listener, addr) = local_pair();
        let mut connector = TcpConnector::new(addr);
        let (mut input, _output) = connector.connect().expect("connect");
        let _peer = listener.accept().expect("accept");

        let readiness = input
            .poll_readable(Duration::from_millis(20))
            .expect("poll");
        assert_eq!(readiness, Readiness::TimedOut);
    }

    #[test]
    fn recv_sees_peer_bytes_and_close() {
        let (listener, addr) = local_pair();
        let mut connector = TcpConnector::new(addr);
        let (mut input, _output) = connector.connect().expect("connect");
        let (mut peer, _) = listener.accept().expect("accept");

        peer.write_all(b"hello").expect("write");
        assert_eq!(
            input
                .poll_readable(Duration::from_millis(500))
                .expect("poll"),
            Readiness::Readable
        );

        let mut buf = [0u8; 16];
        match input.recv(&mut buf).expect("recv") {
            RecvOutcome::Data(n) => assert_eq!(&buf[..n], b"hello"),
            other => panic!("expected data, got {other:?}"),
        }

        drop(peer);
        // EOF shows up as readable, then Closed on recv.
        assert_eq!(
            input
                .poll_readable(Duration::from_millis(500))
                .expect("poll"),
            Readiness::Readable
        );
        assert_eq!(input.recv(&mut buf).expect("recv"), RecvOutcome::Closed);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (listener, addr) = local_pair();
        let mut connector = TcpConnector::new(addr);
        let (_input, mut output) = connector.connect().expect("connect");
        let _peer = listener.accept().expect("accept");

        output.send_all(b"x").expect("send");
        output.shutdown();
        output.shutdown();
    }
}
