//! Framed XML stream over an [`IoStream`].
//!
//! During negotiation the [`XmlStream`] is used as one object. Once the stream is
//! established it is split into a [`FrameReader`] owned by the reader task and a
//! [`FrameWriter`] owned by the writer task.

use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::trace;
use xmpp_wire::{ExtensionRegistry, Frame, Framing, StreamDecoder, StreamEncoder};

use crate::error::SessionError;
use crate::transport::IoStream;

const READ_CHUNK: usize = 8 * 1024;

async fn read_frame<R>(
    rd: &mut R,
    decoder: &mut StreamDecoder,
    buf: &mut BytesMut,
) -> Result<Frame, SessionError>
where
    R: AsyncReadExt + Unpin,
{
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            trace!("<< {}", frame.name());
            return Ok(frame);
        }
        buf.reserve(READ_CHUNK);
        let n = rd.read_buf(buf).await?;
        if n == 0 {
            return Err(SessionError::transport(
                io::ErrorKind::UnexpectedEof,
                "stream closed by peer",
            ));
        }
    }
}

/// Negotiation-time view of a transport
pub struct XmlStream {
    io: IoStream,
    decoder: StreamDecoder,
    encoder: StreamEncoder,
    buf: BytesMut,
}

impl XmlStream {
    /// Wrap a freshly opened transport
    pub fn new(io: IoStream, registry: Arc<ExtensionRegistry>, max_element_size: usize) -> Self {
        let encoder = StreamEncoder::new(io.framing());
        Self {
            io,
            decoder: StreamDecoder::new(registry).with_max_element_size(max_element_size),
            encoder,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Whether the underlying transport is secure
    pub fn is_secure(&self) -> bool {
        self.io.is_secure()
    }

    /// Framing of the underlying transport
    pub fn framing(&self) -> Framing {
        self.encoder.framing()
    }

    /// Encode and write one frame
    pub async fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = self.encoder.encode(frame);
        trace!(">> {}", frame.name());
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read the next frame
    pub async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        read_frame(&mut self.io, &mut self.decoder, &mut self.buf).await
    }

    /// Forget the previous stream header before a restart
    pub fn restart(&mut self) {
        self.decoder.reset();
    }

    /// Upgrade the transport with STARTTLS
    #[cfg(feature = "tls")]
    pub async fn starttls(
        self,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<Self, SessionError> {
        let XmlStream {
            io,
            mut decoder,
            encoder,
            ..
        } = self;
        let io = io.starttls(config, server_name).await?;
        decoder.reset();
        Ok(Self {
            io,
            decoder,
            encoder,
            buf: BytesMut::with_capacity(READ_CHUNK),
        })
    }

    /// Best-effort close of a stream that failed negotiation
    pub async fn abort(mut self) {
        let _ = self.send(&Frame::StreamClose).await;
        let _ = self.io.shutdown().await;
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (rd, wr) = tokio::io::split(self.io);
        (
            FrameReader {
                rd,
                decoder: self.decoder,
                buf: self.buf,
            },
            FrameWriter {
                wr,
                encoder: self.encoder,
            },
        )
    }
}

impl std::fmt::Debug for XmlStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlStream")
            .field("io", &self.io)
            .field("buffered", &self.buf.len())
            .finish()
    }
}

/// Read half of an established stream
pub struct FrameReader {
    rd: ReadHalf<IoStream>,
    decoder: StreamDecoder,
    buf: BytesMut,
}

impl FrameReader {
    /// Read the next frame
    pub async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        read_frame(&mut self.rd, &mut self.decoder, &mut self.buf).await
    }
}

/// Write half of an established stream
pub struct FrameWriter {
    wr: WriteHalf<IoStream>,
    encoder: StreamEncoder,
}

impl FrameWriter {
    /// Encode and write one frame
    pub async fn send(&mut self, frame: &Frame) -> Result<(), SessionError> {
        let bytes = self.encoder.encode(frame);
        trace!(">> {}", frame.name());
        self.wr.write_all(&bytes).await?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Write raw bytes (whitespace keepalive)
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.wr.write_all(bytes).await?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Shut down the write side
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        self.wr.shutdown().await?;
        Ok(())
    }
}
