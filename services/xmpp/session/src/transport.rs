//! Byte transports for xmpp streams.
//!
//! [`IoStream`] is the single stream type the engine reads and writes; the variant
//! is picked by whichever [`Connector`] opened it. TCP may be upgraded in place with
//! STARTTLS, WebSocket carries one XML element per text message, and the in-memory
//! variant backs tests and embedding.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;
use xmpp_wire::Framing;

/// Unified stream type over every supported transport
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream (direct TLS or after STARTTLS)
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// WebSocket (RFC 7395)
    #[cfg(feature = "websocket")]
    WebSocket(Box<websocket::WsStream>),
    /// In-process duplex pipe
    Memory {
        /// Client end of the pipe
        stream: DuplexStream,
        /// Whether the pipe counts as confidential
        secure: bool,
    },
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Memory { stream, .. } => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// True if the transport already provides confidentiality and integrity
    pub fn is_secure(&self) -> bool {
        match self {
            IoStream::Plain(_) => false,
            #[cfg(feature = "tls")]
            IoStream::Tls(_) => true,
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(stream) => stream.is_secure(),
            IoStream::Memory { secure, .. } => *secure,
        }
    }

    /// How stream open/close must be framed on this transport
    pub fn framing(&self) -> Framing {
        match self {
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(_) => Framing::WebSocket,
            _ => Framing::Stream,
        }
    }

    /// Peer address for socket-backed variants
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr().ok(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr().ok(),
            _ => None,
        }
    }

    /// Short variant name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            IoStream::Plain(_) => "tcp",
            #[cfg(feature = "tls")]
            IoStream::Tls(_) => "tls",
            #[cfg(feature = "websocket")]
            IoStream::WebSocket(_) => "websocket",
            IoStream::Memory { .. } => "memory",
        }
    }

    /// Upgrade a plain TCP stream to TLS (STARTTLS)
    #[cfg(feature = "tls")]
    pub async fn starttls(
        self,
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> io::Result<IoStream> {
        match self {
            IoStream::Plain(tcp) => tls::connect_tls(config, tcp, server_name).await,
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("STARTTLS is not possible on a {} transport", other.kind()),
            )),
        }
    }
}

impl fmt::Debug for IoStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoStream")
            .field("kind", &self.kind())
            .field("secure", &self.is_secure())
            .finish()
    }
}

/// Opens a fresh transport for every connection attempt
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a new stream
    async fn open(&self) -> io::Result<IoStream>;
}

/// TCP connector, optionally wrapping the socket in TLS right away
#[derive(Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    #[cfg(feature = "tls")]
    direct_tls: Option<(std::sync::Arc<rustls::ClientConfig>, String)>,
}

impl TcpConnector {
    /// Connect to `host:port` in plain text (STARTTLS happens during negotiation)
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            #[cfg(feature = "tls")]
            direct_tls: None,
        }
    }

    /// Wrap the socket in TLS before the stream opens (XEP-0368)
    #[cfg(feature = "tls")]
    pub fn with_direct_tls(
        mut self,
        config: std::sync::Arc<rustls::ClientConfig>,
        server_name: impl Into<String>,
    ) -> Self {
        self.direct_tls = Some((config, server_name.into()));
        self
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TcpConnector");
        s.field("host", &self.host).field("port", &self.port);
        #[cfg(feature = "tls")]
        s.field("direct_tls", &self.direct_tls.is_some());
        s.finish()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn open(&self) -> io::Result<IoStream> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        tcp.set_nodelay(true)?;
        debug!("TCP connected to {}:{}", self.host, self.port);

        #[cfg(feature = "tls")]
        if let Some((config, server_name)) = &self.direct_tls {
            return tls::connect_tls(config.clone(), tcp, server_name).await;
        }
        Ok(IoStream::Plain(tcp))
    }
}

/// In-process connector; every `open` hands the server end to a [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<DuplexStream>,
    secure: bool,
    buffer: usize,
}

/// Server side of a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryConnector {
    /// Create a connector and the listener that receives its server ends
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                tx,
                secure: true,
                buffer: 64 * 1024,
            },
            MemoryListener { rx },
        )
    }

    /// Whether opened pipes report themselves as secure (default true)
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> io::Result<IoStream> {
        let (client, server) = tokio::io::duplex(self.buffer);
        self.tx.send(server).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "memory listener closed")
        })?;
        Ok(IoStream::Memory {
            stream: client,
            secure: self.secure,
        })
    }
}

impl MemoryListener {
    /// Wait for the next opened pipe
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// Client TLS for STARTTLS and direct TLS
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Install the ring crypto provider if no provider is set yet
    pub fn install_default_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    /// Client configuration trusting the platform roots plus optional extra PEM CAs
    pub fn make_client_config(extra_ca_pem: Option<&str>) -> Result<ClientConfig> {
        install_default_provider();

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for e in &native.errors {
            debug!("Skipping platform certificate store entry: {}", e);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);

        if let Some(pem) = extra_ca_pem {
            let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut pem.as_bytes()).collect();
            let ca_certs = ca_results.context("Failed to parse CA certificates")?;
            for ca_cert in ca_certs {
                roots
                    .add(ca_cert)
                    .context("Failed to add CA certificate to root store")?;
            }
        }

        if roots.is_empty() {
            anyhow::bail!("No trusted root certificates available");
        }

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }

    /// Run the TLS handshake over an established TCP stream
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> io::Result<IoStream> {
        let server_name = ServerName::try_from(sni.to_owned()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("Invalid server name: {}", sni))
        })?;
        debug!("TLS handshake with {}", sni);

        let connector = TlsConnector::from(config);
        let tls_stream = connector.connect(server_name, tcp_stream).await?;
        debug!("TLS established with {}", sni);
        Ok(IoStream::Tls(Box::new(tls_stream)))
    }
}

#[cfg(feature = "websocket")]
/// WebSocket transport (RFC 7395)
pub mod websocket {
    use super::*;
    use bytes::{Buf, BytesMut};
    use futures::{Sink, Stream};
    use std::task::ready;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    fn ws_err(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    /// Byte-stream view of a WebSocket connection
    pub struct WsStream {
        inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
        pending: BytesMut,
        closed: bool,
        secure: bool,
    }

    impl WsStream {
        /// True for `wss://`
        pub fn is_secure(&self) -> bool {
            self.secure
        }
    }

    impl AsyncRead for WsStream {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            loop {
                if !this.pending.is_empty() {
                    let n = buf.remaining().min(this.pending.len());
                    buf.put_slice(&this.pending[..n]);
                    this.pending.advance(n);
                    return Poll::Ready(Ok(()));
                }
                if this.closed {
                    return Poll::Ready(Ok(()));
                }
                match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                    Some(Ok(Message::Text(text))) => this.pending.extend_from_slice(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => this.pending.extend_from_slice(&data),
                    Some(Ok(Message::Close(_))) | None => this.closed = true,
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Poll::Ready(Err(ws_err(e))),
                }
            }
        }
    }

    impl AsyncWrite for WsStream {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<Result<usize, io::Error>> {
            let this = self.get_mut();
            ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_err)?;
            // One write is one complete element, sent as one message
            let text = String::from_utf8(buf.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Pin::new(&mut this.inner)
                .start_send(Message::Text(text))
                .map_err(ws_err)?;
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
            Pin::new(&mut self.get_mut().inner)
                .poll_flush(cx)
                .map_err(ws_err)
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<Result<(), io::Error>> {
            Pin::new(&mut self.get_mut().inner)
                .poll_close(cx)
                .map_err(ws_err)
        }
    }

    /// Connector for `ws://` and `wss://` endpoints
    #[derive(Debug, Clone)]
    pub struct WebSocketConnector {
        url: String,
    }

    impl WebSocketConnector {
        /// Connect to the given endpoint URL
        pub fn new(url: impl Into<String>) -> Self {
            Self { url: url.into() }
        }
    }

    #[async_trait]
    impl Connector for WebSocketConnector {
        async fn open(&self) -> io::Result<IoStream> {
            let secure = self.url.starts_with("wss://");
            if secure {
                tls::install_default_provider();
            }
            let mut request = self.url.as_str().into_client_request().map_err(ws_err)?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));
            let (inner, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(ws_err)?;
            debug!("WebSocket connected to {}", self.url);
            Ok(IoStream::WebSocket(Box::new(WsStream {
                inner,
                pending: BytesMut::new(),
                closed: false,
                secure,
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = TcpConnector::new("127.0.0.1", port).open().await.unwrap();
        assert!(!stream.is_secure());
        assert_eq!(stream.framing(), Framing::Stream);
        assert!(stream.peer_addr().is_some());
    }

    #[tokio::test]
    async fn test_memory_connector_roundtrip() {
        let (connector, mut listener) = MemoryConnector::pair();
        let mut client = connector.open().await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert!(client.is_secure());
        assert_eq!(client.kind(), "memory");

        client.write_all(b"<r xmlns='urn:xmpp:sm:3'/>").await.unwrap();
        let mut buf = [0u8; 26];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"<r xmlns='urn:xmpp:sm:3'/>");
    }

    #[tokio::test]
    async fn test_memory_connector_refused_after_listener_drop() {
        let (connector, listener) = MemoryConnector::pair();
        drop(listener);
        let err = connector.open().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[cfg(feature = "tls")]
    #[tokio::test]
    async fn test_starttls_rejected_on_memory() {
        let (connector, _listener) = MemoryConnector::pair();
        let stream = connector.with_secure(false).open().await.unwrap();
        let config = std::sync::Arc::new(
            rustls::ClientConfig::builder_with_provider(std::sync::Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth(),
        );
        let err = stream.starttls(config, "example.com").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
