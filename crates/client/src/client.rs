//! TCP client for the relay.
//!
//! Requests are lockstep: the protocol carries no correlation IDs, so
//! only one request may be in flight and the next `response` frame on
//! the stream answers it. Chat messages pushed by the relay can arrive
//! interleaved with responses; the read pump tells the two apart and
//! routes pushes to their own channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use parley_protocol::{Action, DEFAULT_MAX_FRAME, Envelope, FrameError, FramedReader, encode_frame};

/// Time allowed for the relay to answer one request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing frame queue capacity.
const SEND_BUFFER_SIZE: usize = 64;

/// Pushed chats buffered while the application is not draining them;
/// anything beyond this is dropped.
const INCOMING_BUFFER_SIZE: usize = 256;

/// Errors from the relay client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("another request is in flight")]
    Busy,

    #[error("relay refused the request: {0}")]
    Refused(String),
}

/// A chat message pushed from the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingChat {
    pub from: String,
    pub text: String,
    /// Sender-stamped time, seconds since the Unix epoch.
    pub time: f64,
}

type PendingReply = Arc<Mutex<Option<oneshot::Sender<Envelope>>>>;

/// A registered connection to the relay.
///
/// Returned by [`Client::connect`] only after the relay accepted the
/// name, so a `Client` always represents a live session.
#[derive(Debug)]
pub struct Client {
    user: String,
    write_tx: mpsc::Sender<Vec<u8>>,
    pending: PendingReply,
    incoming_rx: Option<mpsc::Receiver<IncomingChat>>,
    max_frame: usize,
    cancel: CancellationToken,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl Client {
    /// Connects to the relay and registers `user`.
    pub async fn connect(addr: SocketAddr, user: &str) -> Result<Self, ClientError> {
        Self::connect_with(addr, user, DEFAULT_MAX_FRAME).await
    }

    /// Connects with a non-default frame size limit.
    pub async fn connect_with(
        addr: SocketAddr,
        user: &str,
        max_frame: usize,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(SEND_BUFFER_SIZE);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_BUFFER_SIZE);
        let pending: PendingReply = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                write_pump(write_half, write_rx, cancel.clone()).await;
                cancel.cancel();
            })
        };

        let read_handle = {
            let pending = pending.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                read_pump(read_half, max_frame, pending, incoming_tx, cancel.clone()).await;
                cancel.cancel();
            })
        };

        let client = Self {
            user: user.to_owned(),
            write_tx,
            pending,
            incoming_rx: Some(incoming_rx),
            max_frame,
            cancel,
            _read_handle: read_handle,
            _write_handle: write_handle,
        };

        let reply = client.request(&Envelope::presence(user)).await?;
        if !reply.is_ok() {
            return Err(ClientError::Refused(
                reply
                    .error
                    .unwrap_or_else(|| "registration refused".into()),
            ));
        }
        tracing::debug!(user, %addr, "registered with relay");
        Ok(client)
    }

    /// Name this client registered on the relay.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Takes the receiver for chats pushed by the relay.
    ///
    /// Call once; later calls return `None`. When the receiver lags or
    /// was never taken, chats beyond a small buffer are dropped.
    pub fn take_incoming(&mut self) -> Option<mpsc::Receiver<IncomingChat>> {
        self.incoming_rx.take()
    }

    /// Sends a chat message to `to`.
    ///
    /// Delivery is fire-and-forget: the relay only answers when it
    /// rejects the frame outright.
    pub async fn send_chat(&self, to: &str, text: &str) -> Result<(), ClientError> {
        let frame = encode_frame(&Envelope::chat(&self.user, to, text), self.max_frame)?;
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Fetches this user's contact list.
    pub async fn contacts(&self) -> Result<Vec<String>, ClientError> {
        let reply = self.request(&Envelope::get_contacts(&self.user)).await?;
        expect_data(reply)
    }

    /// Adds `contact` to this user's contact list.
    pub async fn add_contact(&self, contact: &str) -> Result<(), ClientError> {
        let reply = self
            .request(&Envelope::add_contact(&self.user, contact))
            .await?;
        expect_ok(reply)
    }

    /// Removes `contact` from this user's contact list.
    pub async fn remove_contact(&self, contact: &str) -> Result<(), ClientError> {
        let reply = self
            .request(&Envelope::remove_contact(&self.user, contact))
            .await?;
        expect_ok(reply)
    }

    /// Fetches every user name the relay has ever seen.
    pub async fn known_users(&self) -> Result<Vec<String>, ClientError> {
        let reply = self.request(&Envelope::get_users(&self.user)).await?;
        expect_data(reply)
    }

    /// Announces departure and waits for the relay to close the stream.
    pub async fn exit(mut self) -> Result<(), ClientError> {
        let frame = encode_frame(&Envelope::exit(&self.user), self.max_frame)?;
        self.write_tx
            .send(frame)
            .await
            .map_err(|_| ClientError::Closed)?;
        // The relay acknowledges an exit by closing the connection; once
        // the read pump ends the frame is known to have been seen.
        let _ = tokio::time::timeout(REQUEST_TIMEOUT, &mut self._read_handle).await;
        Ok(())
    }

    /// Closes the connection without announcing departure.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Sends a request and waits for the next response frame.
    async fn request(&self, envelope: &Envelope) -> Result<Envelope, ClientError> {
        let frame = encode_frame(envelope, self.max_frame)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                return Err(ClientError::Busy);
            }
            *pending = Some(tx);
        }

        if self.write_tx.send(frame).await.is_err() {
            self.pending.lock().await.take();
            return Err(ClientError::Closed);
        }

        let result = tokio::time::timeout(REQUEST_TIMEOUT, rx).await;

        // Clear the slot on any exit path.
        self.pending.lock().await.take();

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}

fn expect_ok(reply: Envelope) -> Result<(), ClientError> {
    if reply.is_ok() {
        Ok(())
    } else {
        Err(ClientError::Refused(
            reply.error.unwrap_or_else(|| "request refused".into()),
        ))
    }
}

fn expect_data(reply: Envelope) -> Result<Vec<String>, ClientError> {
    if !reply.is_ok() {
        return Err(ClientError::Refused(
            reply.error.unwrap_or_else(|| "request refused".into()),
        ));
    }
    Ok(reply.data_list.unwrap_or_default())
}

async fn read_pump(
    read_half: OwnedReadHalf,
    max_frame: usize,
    pending: PendingReply,
    incoming_tx: mpsc::Sender<IncomingChat>,
    cancel: CancellationToken,
) {
    let mut reader = FramedReader::new(read_half, max_frame);
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.next_frame() => match result {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    tracing::debug!("relay closed the stream");
                    break;
                }
                Err(e) => {
                    tracing::debug!("read failed: {e}");
                    break;
                }
            },
        };

        if envelope.response.is_some() {
            match pending.lock().await.take() {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => tracing::debug!("response with no request outstanding"),
            }
        } else if envelope.action == Some(Action::Message) {
            let (Some(from), Some(text)) = (envelope.sender, envelope.text) else {
                tracing::debug!("chat push without sender or text");
                continue;
            };
            let chat = IncomingChat {
                from,
                text,
                time: envelope.time.unwrap_or(0.0),
            };
            if let Err(e) = incoming_tx.try_send(chat) {
                tracing::warn!("dropping incoming chat: {e}");
            }
        } else {
            tracing::debug!(action = ?envelope.action, "ignoring unexpected frame");
        }
    }

    // Fail any request still waiting by dropping its reply sender.
    pending.lock().await.take();
}

async fn write_pump(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_half.write_all(&frame).await {
                        tracing::debug!("write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = write_half.shutdown().await;
}
