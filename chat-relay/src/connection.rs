//! Per-connection handler.
//!
//! A handler is created by the accept loop, which registers it before the
//! handler task is spawned, and then runs two halves until either finishes:
//!
//! - the read half decodes frames and broadcasts each message to every other
//!   registered client;
//! - the write half drains this client's [`Outbox`] onto the socket. It is
//!   the only writer for the socket, so frames from concurrent broadcasts are
//!   written whole and never interleave.
//!
//! End of stream, any I/O error, any malformed frame, or eviction from the
//! registry closes the connection for good. Eviction interrupts both halves,
//! including a write blocked on a peer that stopped reading. There is no retry and no attempt
//! to resynchronise a broken stream.

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select, time,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::{
    codec::{FrameCodec, FrameError},
    config::RelayConfig,
    message::Message,
    registry::{ClientEntry, ClientId, Outbox, Registration, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer closed its side of the stream between frames.
    EndOfStream,
    /// The peer sent bytes that do not form a valid frame.
    Protocol(FrameError),
    Transport(io::Error),
    /// The registry dropped this client, usually because it fell too far behind.
    Evicted,
    WriteTimeout,
}

impl CloseReason {
    fn from_frame_error(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => CloseReason::Transport(err),
            other => CloseReason::Protocol(other),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::EndOfStream => f.write_str("end of stream"),
            CloseReason::Protocol(err) => write!(f, "protocol error: {err}"),
            CloseReason::Transport(err) => write!(f, "transport error: {err}"),
            CloseReason::Evicted => f.write_str("evicted from registry"),
            CloseReason::WriteTimeout => f.write_str("write timed out"),
        }
    }
}

pub struct ConnectionHandler {
    peer: SocketAddr,
    frames: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
    outbox: Outbox,
    registration: Registration,
    write_timeout: Option<Duration>,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Takes ownership of an accepted stream and registers it.
    ///
    /// Runs synchronously so the accept loop can register each connection
    /// before it accepts the next one.
    pub fn open(
        stream: TcpStream,
        peer: SocketAddr,
        registry: &Arc<Registry>,
        config: &RelayConfig,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let (entry, outbox) = ClientEntry::new(peer, config.outbound_queue);
        let registration = registry.register_scoped(entry);

        let mut handler = Self {
            peer,
            frames: FramedRead::new(reader, config.codec()),
            writer,
            outbox,
            registration,
            write_timeout: config.write_timeout,
            state: ConnectionState::Connecting,
        };
        handler.transition(ConnectionState::Open);
        info!(peer = %peer, client = %handler.id(), "client connected");
        handler
    }

    pub fn id(&self) -> ClientId {
        self.registration.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Relays traffic until the connection ends, then releases it.
    pub async fn run(mut self) -> CloseReason {
        let evicted = self.outbox.eviction();
        let reason = {
            let inbound = pump_inbound(&mut self.frames, &self.registration);
            let outbound = pump_outbound(&mut self.writer, &mut self.outbox, self.write_timeout);
            select! {
                _ = evicted.cancelled() => CloseReason::Evicted,
                reason = inbound => reason,
                reason = outbound => reason,
            }
        };

        self.transition(ConnectionState::Closing);
        self.registration.release();
        if let Err(err) = self.writer.shutdown().await {
            debug!(peer = %self.peer, error = ?err, "failed to shut down socket cleanly");
        }
        self.transition(ConnectionState::Closed);

        match &reason {
            CloseReason::EndOfStream => {
                info!(peer = %self.peer, client = %self.id(), "client disconnected");
            }
            CloseReason::Transport(err) => {
                info!(peer = %self.peer, client = %self.id(), error = %err, "client connection lost");
            }
            other => {
                warn!(peer = %self.peer, client = %self.id(), reason = %other, "client connection closed");
            }
        }
        reason
    }

    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(next > self.state, "connection state went from {:?} to {next:?}", self.state);
        debug!(peer = %self.peer, from = ?self.state, to = ?next, "connection state change");
        self.state = next;
    }
}

async fn pump_inbound(
    frames: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    registration: &Registration,
) -> CloseReason {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => relay_message(registration, &message),
            Err(err) => return CloseReason::from_frame_error(err),
        }
    }
    CloseReason::EndOfStream
}

fn relay_message(registration: &Registration, message: &Message) {
    match registration.broadcast(message) {
        Ok(report) => debug!(
            client = %registration.id(),
            kind = ?message.kind(),
            bytes = message.payload_len(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "relayed message"
        ),
        Err(err) => warn!(client = %registration.id(), error = %err, "failed to relay message"),
    }
}

async fn pump_outbound(
    writer: &mut OwnedWriteHalf,
    outbox: &mut Outbox,
    write_timeout: Option<Duration>,
) -> CloseReason {
    while let Some(frame) = outbox.next_frame().await {
        let result = match write_timeout {
            Some(limit) => match time::timeout(limit, writer.write_all(&frame)).await {
                Ok(result) => result,
                Err(_) => return CloseReason::WriteTimeout,
            },
            None => writer.write_all(&frame).await,
        };
        if let Err(err) = result {
            return CloseReason::Transport(err);
        }
    }
    CloseReason::Evicted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_only_move_forward() {
        assert!(ConnectionState::Connecting < ConnectionState::Open);
        assert!(ConnectionState::Open < ConnectionState::Closing);
        assert!(ConnectionState::Closing < ConnectionState::Closed);
    }

    #[test]
    fn io_failures_are_transport_errors() {
        let reason = CloseReason::from_frame_error(FrameError::Io(io::ErrorKind::BrokenPipe.into()));
        assert!(matches!(reason, CloseReason::Transport(_)));

        let reason = CloseReason::from_frame_error(FrameError::UnknownType(9));
        assert!(matches!(reason, CloseReason::Protocol(FrameError::UnknownType(9))));
    }

    #[tokio::test]
    async fn handler_registers_on_open_and_releases_on_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::default());

        let client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let handler = ConnectionHandler::open(stream, peer, &registry, &RelayConfig::default());
        assert_eq!(handler.state(), ConnectionState::Open);
        assert_eq!(registry.len(), 1);

        drop(client);
        let reason = handler.run().await;
        assert!(matches!(reason, CloseReason::EndOfStream | CloseReason::Transport(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn eviction_closes_a_connection_that_is_still_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(Registry::default());
        let config = RelayConfig {
            outbound_queue: 1,
            ..RelayConfig::default()
        };

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let handler = ConnectionHandler::open(stream, peer, &registry, &config);

        let (entry, _outbox) = ClientEntry::new(peer, 8);
        let sender = registry.register(entry);
        registry.broadcast(&Message::text("one"), &sender).unwrap();
        let report = registry.broadcast(&Message::text("two"), &sender).unwrap();
        assert_eq!(report.evicted, vec![handler.id()]);

        let reason = time::timeout(Duration::from_secs(2), handler.run())
            .await
            .expect("evicted handler should stop");
        assert!(matches!(reason, CloseReason::Evicted));
        assert_eq!(registry.len(), 1);
    }
}
