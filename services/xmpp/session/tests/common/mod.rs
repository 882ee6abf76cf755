//! Scripted in-memory server used by the connection scenarios.

#![allow(dead_code)]

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use xmpp_session::{
    BackoffConfig, Connection, ConnectionConfig, ConnectionEvent, MemoryConnector, MemoryListener,
    PlainCredentials, ReconnectPolicy,
};
use xmpp_wire::{
    ns, Element, ErrorCondition, ExtensionRegistry, Frame, Framing, Nonza, SmEnabled, Stanza,
    StreamDecoder, StreamEncoder, StreamFeatures, StreamHeader,
};

pub const JID: &str = "user@example.com/test";
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with automatic traffic switched off so scripts see only what tests send
pub fn test_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new("example.com");
    config.resource = Some("test".to_string());
    config.reply_timeout = Duration::from_secs(2);
    config.keepalive_interval = None;
    config.stream_management.ack_request.every_stanzas = None;
    config.stream_management.ack_request.interval = None;
    config.reconnect = ReconnectPolicy {
        enabled: true,
        max_attempts: Some(3),
        backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            factor: 2.0,
            jitter: 0.0,
        },
    };
    config
}

pub fn new_connection(config: ConnectionConfig) -> (Connection, MemoryListener) {
    let (connector, listener) = MemoryConnector::pair();
    let conn = Connection::new(
        config,
        Arc::new(connector),
        Arc::new(PlainCredentials::new("user", "pencil")),
    )
    .unwrap();
    (conn, listener)
}

pub fn auth_features() -> StreamFeatures {
    StreamFeatures {
        mechanisms: vec!["SCRAM-SHA-1".to_string(), "PLAIN".to_string()],
        ..StreamFeatures::default()
    }
}

pub fn session_features() -> StreamFeatures {
    StreamFeatures {
        bind: true,
        stream_management: true,
        ..StreamFeatures::default()
    }
}

/// Connect `conn` against a server that accepts everything and enables `sm_id`
pub async fn connect(conn: &Connection, listener: &mut MemoryListener, sm_id: &str) -> ServerStream {
    let (result, server) = tokio::join!(conn.connect(), async {
        let mut server = ServerStream::accept(listener).await;
        server.authenticate().await;
        server.open(session_features()).await;
        server.accept_bind().await;
        server.accept_sm(sm_id).await;
        server
    });
    result.unwrap();
    server
}

/// Wait for the first event matching `pred`
pub async fn wait_for<F>(events: &mut broadcast::Receiver<ConnectionEvent>, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn ids(stanzas: &[Stanza]) -> Vec<String> {
    stanzas
        .iter()
        .map(|s| s.id().unwrap_or_default().to_string())
        .collect()
}

pub fn message(id: &str) -> Stanza {
    Stanza::message()
        .id(id)
        .to("peer@example.com")
        .stanza_type("chat")
        .body(id)
        .build()
}

/// Server end of one in-memory transport
pub struct ServerStream {
    io: DuplexStream,
    decoder: StreamDecoder,
    encoder: StreamEncoder,
    buf: BytesMut,
}

impl ServerStream {
    pub async fn accept(listener: &mut MemoryListener) -> Self {
        let io = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
            .await
            .expect("timed out waiting for a transport")
            .expect("connector dropped");
        Self {
            io,
            decoder: StreamDecoder::new(Arc::new(ExtensionRegistry::new())),
            encoder: StreamEncoder::new(Framing::Stream),
            buf: BytesMut::new(),
        }
    }

    pub async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                if let Some(frame) = self.decoder.decode(&mut self.buf).unwrap() {
                    return frame;
                }
                let n = self.io.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "client closed the transport");
            }
        })
        .await
        .expect("timed out waiting for a client frame")
    }

    /// Next stanza, skipping ack requests
    pub async fn next_stanza(&mut self) -> Stanza {
        loop {
            match self.next_frame().await {
                Frame::Stanza(stanza) => return stanza,
                Frame::Nonza(Nonza::SmAckRequest) => continue,
                other => panic!("expected a stanza, got {:?}", other),
            }
        }
    }

    pub async fn next_nonza(&mut self) -> Nonza {
        match self.next_frame().await {
            Frame::Nonza(nonza) => nonza,
            other => panic!("expected a nonza, got {:?}", other),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = self.encoder.encode(&frame);
        self.io.write_all(&bytes).await.unwrap();
        self.io.flush().await.unwrap();
    }

    /// Write several frames with a single write
    pub async fn send_batch(&mut self, frames: &[Frame]) {
        let mut bytes = BytesMut::new();
        for frame in frames {
            bytes.extend_from_slice(&self.encoder.encode(frame));
        }
        self.io.write_all(&bytes).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn send_stanza(&mut self, stanza: Stanza) {
        self.send(Frame::Stanza(stanza)).await;
    }

    pub async fn send_nonza(&mut self, nonza: Nonza) {
        self.send(Frame::Nonza(nonza)).await;
    }

    /// Answer the client's stream header and advertise `features`
    pub async fn open(&mut self, features: StreamFeatures) {
        match self.next_frame().await {
            Frame::StreamOpen(header) => assert_eq!(header.to.as_deref(), Some("example.com")),
            other => panic!("expected stream header, got {:?}", other),
        }
        let header = StreamHeader {
            to: None,
            from: Some("example.com".to_string()),
            id: Some(xmpp_wire::next_stanza_id()),
            version: Some("1.0".to_string()),
            lang: None,
            content_ns: ns::CLIENT.to_string(),
        };
        self.send(Frame::StreamOpen(header)).await;
        self.send_nonza(Nonza::Features(features)).await;
    }

    /// Open the first stream and accept PLAIN
    pub async fn authenticate(&mut self) {
        self.open(auth_features()).await;
        match self.next_nonza().await {
            Nonza::SaslAuth { mechanism, initial } => {
                assert_eq!(mechanism, "PLAIN");
                assert_eq!(initial.as_deref(), Some(&b"\0user\0pencil"[..]));
            }
            other => panic!("expected auth, got {:?}", other),
        }
        self.send_nonza(Nonza::SaslSuccess(None)).await;
    }

    /// Open the first stream and refuse the credentials
    pub async fn reject_auth(&mut self) {
        self.open(auth_features()).await;
        assert!(matches!(self.next_nonza().await, Nonza::SaslAuth { .. }));
        self.send_nonza(Nonza::SaslFailure(ErrorCondition {
            condition: "not-authorized".to_string(),
            text: None,
        }))
        .await;
    }

    pub async fn accept_bind(&mut self) {
        let request = self.next_stanza().await;
        assert_eq!(request.stanza_type(), Some("set"));
        let bind = request
            .extension("bind", ns::BIND)
            .expect("bind request without payload");
        assert_eq!(
            bind.element().get_child("resource", ns::BIND).map(|r| r.text()),
            Some("test".to_string())
        );

        let mut payload = Element::new("bind", ns::BIND);
        payload.push_child(Element::new("jid", ns::BIND).with_text(JID));
        self.send_stanza(request.reply().stanza_type("result").extension(payload).build())
            .await;
    }

    pub async fn accept_sm(&mut self, id: &str) {
        match self.next_nonza().await {
            Nonza::SmEnable { resume, .. } => assert!(resume),
            other => panic!("expected enable, got {:?}", other),
        }
        self.send_nonza(Nonza::SmEnabled(SmEnabled {
            id: Some(id.to_string()),
            resume: true,
            max: Some(300),
            location: None,
        }))
        .await;
    }

    /// Authenticate, then expect `<resume/>` for `previd` and return the client's `h`
    pub async fn expect_resume(&mut self, previd: &str) -> u32 {
        self.authenticate().await;
        self.open(session_features()).await;
        match self.next_nonza().await {
            Nonza::SmResume { h, previd: requested } => {
                assert_eq!(requested, previd);
                h
            }
            other => panic!("expected resume, got {:?}", other),
        }
    }
}
