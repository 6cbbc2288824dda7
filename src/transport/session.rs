//! Per-Connection Session State
//!
//! A `Session` is the shared handle to one live socket: its lifecycle flags,
//! the sender side of its outbound queue and the cancellation token its reader
//! and writer workers watch. The socket halves themselves are owned by those
//! two workers, so nothing else can touch the stream once the session has left
//! the registry.

use super::framer::Framer;
use super::types::{Message, NodeId};

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket is open but the first frame / identity has not been processed.
    Handshaking,
    Active,
    /// Close requested; workers are unwinding.
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    usable: AtomicBool,
    short: AtomicBool,
    closed: AtomicBool,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

/// Everything the writer worker needs, moved into it at spawn time.
pub(crate) struct SessionWriter {
    pub half: OwnedWriteHalf,
    pub outbound: mpsc::Receiver<Message>,
}

/// Read half plus the fixed read buffer and the carry-over of partial frames.
pub(crate) struct SessionReader {
    half: OwnedReadHalf,
    buffer: Vec<u8>,
    carry: BytesMut,
}

impl Session {
    pub(crate) fn open(
        stream: TcpStream,
        read_buffer_len: usize,
        outbound_capacity: usize,
    ) -> std::io::Result<(std::sync::Arc<Self>, SessionReader, SessionWriter)> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));

        let session = std::sync::Arc::new(Self {
            peer_addr,
            local_addr,
            usable: AtomicBool::new(false),
            short: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            outbound: tx,
            cancel: CancellationToken::new(),
        });

        let reader = SessionReader {
            half: read_half,
            buffer: vec![0u8; read_buffer_len.max(1)],
            carry: BytesMut::new(),
        };

        let writer = SessionWriter {
            half: write_half,
            outbound: rx,
        };

        Ok((session, reader, writer))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer address as a node id, used when a frame arrives without `From`.
    pub fn addr_id(&self) -> NodeId {
        NodeId(self.peer_addr.to_string())
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub(crate) fn mark_usable(&self) {
        self.usable.store(true, Ordering::Release);
    }

    pub fn is_short(&self) -> bool {
        self.short.load(Ordering::Acquire)
    }

    pub(crate) fn mark_short(&self) {
        self.short.store(true, Ordering::Release);
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.cancel.is_cancelled() {
            SessionState::Closing
        } else if self.usable.load(Ordering::Acquire) {
            SessionState::Active
        } else {
            SessionState::Handshaking
        }
    }

    /// Queues a message for the writer. Returns `false` if the session is gone.
    pub async fn enqueue(&self, msg: Message) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.outbound.send(msg).await.is_ok()
    }

    /// Signals both workers to stop. The socket closes once they drop their halves.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

impl SessionReader {
    /// Performs one socket read and returns the frames it completed.
    ///
    /// `Ok(None)` means the peer closed the connection.
    pub(crate) async fn read_frames(&mut self, framer: &Framer) -> std::io::Result<Option<Vec<Bytes>>> {
        let n = self.half.read(&mut self.buffer).await?;
        if n == 0 {
            return Ok(None);
        }
        self.carry.extend_from_slice(&self.buffer[..n]);
        Ok(Some(framer.unpack(&mut self.carry)))
    }
}
