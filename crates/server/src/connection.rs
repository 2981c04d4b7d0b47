//! Per-connection read/write pumps.
//!
//! Each accepted socket is split into two tokio tasks. The read pump
//! decodes frames and forwards them to the dispatch loop as
//! [`ConnEvent`]s; the write pump drains a bounded command channel onto
//! the socket. The dispatch loop keeps only a [`ConnectionHandle`] and
//! never touches the socket itself.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley_protocol::{Envelope, FramedReader, write_frame};

use crate::registry::ConnId;
use crate::SEND_BUFFER_SIZE;

/// Inbound event from a connection's read pump.
#[derive(Debug)]
pub enum ConnEvent {
    /// A decoded frame arrived.
    Frame { conn: ConnId, envelope: Envelope },
    /// The connection is gone: clean EOF, transport error or corrupt
    /// frame. There is no distinction worth acting on; the peer is gone
    /// either way.
    Closed { conn: ConnId },
}

/// Command for a connection's write pump.
#[derive(Debug)]
pub enum WriteCmd {
    Frame(Envelope),
    /// Close the socket after everything queued before this command has
    /// been written.
    Shutdown,
}

/// The write pump cannot take the frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("send buffer full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// Dispatch-loop-side handle for one live connection.
pub struct ConnectionHandle {
    pub id: ConnId,
    pub peer_addr: SocketAddr,
    tx: mpsc::Sender<WriteCmd>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnId,
        peer_addr: SocketAddr,
        tx: mpsc::Sender<WriteCmd>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            tx,
            cancel,
        }
    }

    /// Hands a frame to the write pump without blocking.
    pub fn try_send_frame(&self, envelope: Envelope) -> Result<(), SendError> {
        self.tx
            .try_send(WriteCmd::Frame(envelope))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SendError::Full,
                mpsc::error::TrySendError::Closed(_) => SendError::Closed,
            })
    }

    /// Closes the connection after flushing already queued frames.
    pub fn request_shutdown(&self) {
        // If the command cannot be queued the pump is wedged or gone;
        // fall back to the hard teardown.
        if self.tx.try_send(WriteCmd::Shutdown).is_err() {
            self.cancel.cancel();
        }
    }

    /// Tears the connection down immediately.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Spawns the read and write pumps for an accepted socket.
///
/// The pumps stop when the peer disconnects, the handle asks for
/// shutdown, or `server_cancel` fires; whichever pump exits first
/// cancels the other. The read task always reports [`ConnEvent::Closed`]
/// on its way out.
pub fn spawn_connection(
    id: ConnId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_frame: usize,
    events: mpsc::Sender<ConnEvent>,
    server_cancel: &CancellationToken,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::channel::<WriteCmd>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let (read_half, write_half) = stream.into_split();

    let write_cancel = cancel.clone();
    tokio::spawn(async move {
        write_pump(write_half, rx, max_frame, write_cancel.clone()).await;
        write_cancel.cancel();
    });

    let read_cancel = cancel.clone();
    tokio::spawn(async move {
        read_pump(read_half, id, peer_addr, max_frame, &events, read_cancel.clone()).await;
        read_cancel.cancel();
        let _ = events.send(ConnEvent::Closed { conn: id }).await;
    });

    ConnectionHandle::new(id, peer_addr, tx, cancel)
}

async fn read_pump(
    read_half: OwnedReadHalf,
    id: ConnId,
    peer_addr: SocketAddr,
    max_frame: usize,
    events: &mpsc::Sender<ConnEvent>,
    cancel: CancellationToken,
) {
    let mut reader = FramedReader::new(read_half, max_frame);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            frame = reader.next_frame() => {
                match frame {
                    Ok(Some(envelope)) => {
                        // Backpressure: wait for the dispatch loop rather
                        // than buffer unboundedly.
                        if events.send(ConnEvent::Frame { conn: id, envelope }).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(conn = %id, %peer_addr, "peer closed the stream");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(conn = %id, %peer_addr, "read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}

async fn write_pump(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WriteCmd>,
    max_frame: usize,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            cmd = rx.recv() => {
                match cmd {
                    Some(WriteCmd::Frame(envelope)) => {
                        if let Err(e) = write_frame(&mut write_half, &envelope, max_frame).await {
                            tracing::debug!("write failed: {e}");
                            break;
                        }
                    }
                    Some(WriteCmd::Shutdown) => break,
                    None => break,
                }
            }
        }
    }

    // Best-effort FIN so the peer sees an orderly close.
    let _ = write_half.shutdown().await;
}
