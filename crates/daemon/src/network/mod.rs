//! Logical client connections.
//!
//! A logical connection outlives the socket underneath it: when a client
//! drops off, its session keeps the [`Connection`] in a detached state, and a
//! later handshake for the same client id attaches a fresh transport to it.
//!
//! Messages are carried in frames from [`protocol::framing`], one message per
//! frame.

use std::future::Future;
use std::pin::Pin;

use bytes::{Buf, BytesMut};
use protocol::{Frame, FrameCodec, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Initial capacity of the inbound buffer.
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Any byte stream a connection can run over (TCP in production, duplex pipes in tests).
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// A type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Errors raised by a logical connection.
///
/// Transport failures are local to the connection: the session that owns it
/// closes the connection side and keeps its shell running. A [`Frame`] error
/// means the client sent bytes that are not valid frames and ends the session.
///
/// [`Frame`]: ConnectionError::Frame
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed the transport.
    #[error("connection closed by peer")]
    Closed,

    /// No transport is attached.
    #[error("connection is not attached to a transport")]
    NotConnected,

    /// The transport failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream did not contain valid frames.
    #[error("framing error: {0}")]
    Frame(#[from] ProtocolError),
}

/// A transport handed to an existing connection, plus any bytes already read from it.
pub struct Attachment {
    /// The new transport.
    pub transport: BoxedTransport,
    /// Inbound bytes read during the handshake but not yet consumed.
    pub pending: BytesMut,
}

impl Attachment {
    /// Attachment with nothing read ahead.
    pub fn new(transport: BoxedTransport) -> Self {
        Self {
            transport,
            pending: BytesMut::new(),
        }
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// A reconnect-capable, message-oriented connection to one client.
pub trait Connection: Send {
    /// The client this connection belongs to.
    fn client_id(&self) -> &str;

    /// Whether a transport is currently attached.
    fn is_connected(&self) -> bool;

    /// Wait until inbound data arrives and buffer it.
    ///
    /// Cancel safe: no data is lost if the future is dropped before completing.
    fn wait_readable<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;

    /// Whether a complete message is buffered and can be read without waiting.
    fn has_buffered_data(&self) -> bool;

    /// Take the next complete buffered message, if any.
    fn read_message(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;

    /// Send one message.
    fn write_message<'a>(
        &'a mut self,
        message: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>>;

    /// Drop the transport and anything buffered from it.
    fn close(&mut self);

    /// Attach a new transport, replacing any current one.
    fn attach(&mut self, attachment: Attachment);
}

/// [`Connection`] over any [`Transport`] using the frame codec.
pub struct FramedConnection {
    client_id: String,
    transport: Option<BoxedTransport>,
    codec: FrameCodec,
    read_buf: BytesMut,
}

impl FramedConnection {
    /// Connection for a known client.
    pub fn new(client_id: impl Into<String>, transport: BoxedTransport) -> Self {
        Self {
            client_id: client_id.into(),
            transport: Some(transport),
            codec: FrameCodec::new(),
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Connection whose client has not identified itself yet.
    pub fn accept(transport: BoxedTransport) -> Self {
        Self::new(String::new(), transport)
    }

    /// A connection with no transport, waiting for a client to attach.
    pub fn detached(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            transport: None,
            codec: FrameCodec::new(),
            read_buf: BytesMut::new(),
        }
    }

    /// Record which client this connection belongs to.
    pub fn identify(&mut self, client_id: impl Into<String>) {
        self.client_id = client_id.into();
    }

    /// Wait for the next complete message.
    pub async fn next_message(&mut self) -> Result<Vec<u8>, ConnectionError> {
        loop {
            if let Some(message) = self.read_message()? {
                return Ok(message);
            }
            self.wait_readable().await?;
        }
    }

    /// Give up the transport together with any unread bytes.
    pub fn into_attachment(mut self) -> Option<Attachment> {
        let transport = self.transport.take()?;
        Some(Attachment {
            transport,
            pending: std::mem::take(&mut self.read_buf),
        })
    }
}

impl Connection for FramedConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn wait_readable<'a>(
        &'a mut self,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>> {
        Box::pin(async move {
            let transport = self
                .transport
                .as_mut()
                .ok_or(ConnectionError::NotConnected)?;

            if transport.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ConnectionError::Closed);
            }
            Ok(())
        })
    }

    fn has_buffered_data(&self) -> bool {
        // A corrupt header also counts: reading it surfaces the error.
        !matches!(self.codec.try_decode(&self.read_buf), Ok(None))
    }

    fn read_message(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        match self.codec.try_decode(&self.read_buf)? {
            Some((frame, consumed)) => {
                self.read_buf.advance(consumed);
                Ok(Some(frame.into_payload()))
            }
            None => Ok(None),
        }
    }

    fn write_message<'a>(
        &'a mut self,
        message: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), ConnectionError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(transport) = self.transport.as_mut() else {
                debug!(
                    client_id = %self.client_id,
                    len = message.len(),
                    "Dropping outbound message while detached"
                );
                return Ok(());
            };

            let bytes = self.codec.encode(&Frame::new(message.to_vec()))?;
            transport.write_all(&bytes).await?;
            transport.flush().await?;
            Ok(())
        })
    }

    fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!(client_id = %self.client_id, "Connection side closed");
        }
        self.read_buf.clear();
    }

    fn attach(&mut self, attachment: Attachment) {
        debug!(
            client_id = %self.client_id,
            pending = attachment.pending.len(),
            "Transport attached"
        );
        self.transport = Some(attachment.transport);
        self.read_buf = attachment.pending;
    }
}
