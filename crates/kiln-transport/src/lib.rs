//! Tokio-based framed channel to the build worker.
//!
//! This crate implements:
//! - big-endian u32 length-prefixed framing with size checks before allocation
//! - chunked reads/writes through a bounded internal buffer
//! - a [`TransportChannel`] that owns separate read and write loops and reports
//!   incoming messages and disconnects as [`ChannelEvent`]s

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_proto::{decode_message, encode_message, WireMessage, LENGTH_PREFIX_BYTES, MAX_FRAME_BYTES};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Size of the internal read/write buffer. Larger frames are moved in chunks.
pub const BUFFER_SIZE: usize = 1024;

const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("allocation failed: {message}")]
    AllocationFailed { message: String },

    #[error("frame too large: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("decode error: {message}")]
    Decode { message: String },

    #[error("encode error: {message}")]
    Encode { message: String },

    #[error("channel closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io {
            message: err.to_string(),
        }
    }
}

/// Reads length-prefixed [`WireMessage`]s.
pub struct FrameReader<R> {
    inner: R,
    buf: Box<[u8]>,
    max_frame_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: vec![0u8; BUFFER_SIZE].into_boxed_slice(),
            max_frame_len,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the channel before a complete
    /// length prefix arrived.
    pub async fn read_message(&mut self) -> Result<Option<WireMessage>, TransportError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = self.inner.read(&mut prefix[filled..]).await?;
            if n == 0 {
                return Ok(None);
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        // Reserve fallibly so allocation failure surfaces as an error instead of aborting the process.
        let mut payload = Vec::new();
        payload.try_reserve_exact(len).map_err(|err| TransportError::AllocationFailed {
            message: format!("allocate frame buffer ({len} bytes): {err}"),
        })?;

        while payload.len() < len {
            let want = (len - payload.len()).min(self.buf.len());
            let n = self.inner.read(&mut self.buf[..want]).await?;
            if n == 0 {
                return Err(TransportError::Io {
                    message: format!(
                        "channel closed mid-frame ({} of {len} bytes read)",
                        payload.len()
                    ),
                });
            }
            payload.extend_from_slice(&self.buf[..n]);
        }

        decode_message(&payload)
            .map(Some)
            .map_err(|err| TransportError::Decode {
                message: err.to_string(),
            })
    }
}

/// Writes length-prefixed [`WireMessage`]s.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_len: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            max_frame_len: MAX_FRAME_BYTES,
        }
    }

    pub async fn write_message(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let payload = encode_message(message).map_err(|err| TransportError::Encode {
            message: err.to_string(),
        })?;
        if payload.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame_len,
        })?;

        self.inner.write_all(&len.to_be_bytes()).await?;
        for chunk in payload.chunks(BUFFER_SIZE) {
            self.inner.write_all(chunk).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(WireMessage),
    /// The channel is gone. `None` means the peer closed it cleanly.
    Closed(Option<TransportError>),
}

struct Inner {
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn close(&self, err: Option<TransportError>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self.events.send(ChannelEvent::Closed(err));
    }
}

/// A duplex message channel driven by background read/write tasks.
///
/// Messages are written in the order they were sent. Incoming messages and the
/// final [`ChannelEvent::Closed`] are delivered on the receiver returned by
/// [`TransportChannel::start`].
pub struct TransportChannel {
    inner: Arc<Inner>,
    tx: mpsc::Sender<WireMessage>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl TransportChannel {
    pub fn start<R, W>(reader: R, writer: W) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

        let inner = Arc::new(Inner {
            events: events_tx,
            closed: AtomicBool::new(false),
            shutdown_tx,
        });

        let read_task = tokio::spawn(read_loop(
            FrameReader::new(reader),
            inner.clone(),
            shutdown_rx.clone(),
        ));
        let write_task = tokio::spawn(write_loop(
            FrameWriter::new(writer),
            inner.clone(),
            shutdown_rx,
            rx,
        ));

        (
            Self {
                inner,
                tx,
                read_task,
                write_task,
            },
            events_rx,
        )
    }

    /// Queue a message for writing.
    pub async fn send(&self, message: WireMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flush queued writes, then stop both loops.
    pub async fn close(self) {
        let Self {
            inner,
            tx,
            read_task,
            write_task,
        } = self;
        // Dropping the sender lets the write loop drain what is queued and exit.
        drop(tx);
        let _ = write_task.await;
        inner.close(None);
        read_task.abort();
        let _ = read_task.await;
    }
}

async fn write_loop<W: AsyncWrite + Unpin + Send + 'static>(
    mut writer: FrameWriter<W>,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut rx: mpsc::Receiver<WireMessage>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            message = rx.recv() => {
                let Some(message) = message else { break; };
                if let Err(err) = writer.write_message(&message).await {
                    tracing::debug!(target: "kiln.transport", error = %err, "write failed");
                    inner.close(Some(err));
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn read_loop<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: FrameReader<R>,
    inner: Arc<Inner>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            res = reader.read_message() => {
                match res {
                    Ok(Some(message)) => {
                        if inner.events.send(ChannelEvent::Message(message)).is_err() {
                            // Nobody is listening any more.
                            inner.close(None);
                            break;
                        }
                    }
                    Ok(None) => {
                        inner.close(None);
                        break;
                    }
                    Err(err) => {
                        tracing::debug!(target: "kiln.transport", error = %err, "read failed");
                        inner.close(Some(err));
                        break;
                    }
                }
            }
        }
    }
}
