//! Incremental stream decoder and encoder.
//!
//! The decoder is fed raw bytes and hands back one complete top-level item at a
//! time. Partial input is left in the buffer untouched until more bytes arrive,
//! so a read may split an element anywhere, including inside a tag or an entity.

use bytes::{Buf, Bytes, BytesMut};
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::sync::Arc;
use tracing::trace;

use crate::element::Element;
use crate::error::WireError;
use crate::frame::{Frame, StreamHeader};
use crate::nonza::Nonza;
use crate::ns;
use crate::registry::ExtensionRegistry;
use crate::stanza::{Stanza, StanzaKind};

/// Default upper bound on a single buffered top-level element (1 MiB)
pub const DEFAULT_MAX_ELEMENT_SIZE: usize = 1024 * 1024;

/// How stream open/close are expressed on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `<stream:stream>` ... `</stream:stream>` (TCP, TLS)
    Stream,
    /// RFC 7395 `<open/>` and `<close/>`, one element per message
    WebSocket,
}

#[derive(Debug, Clone)]
struct Scope {
    default_ns: String,
    prefixes: Vec<(String, String)>,
}

impl Scope {
    fn stream_level() -> Self {
        Self {
            default_ns: ns::CLIENT.to_string(),
            prefixes: vec![
                ("xml".to_string(), ns::XML.to_string()),
                ("stream".to_string(), ns::STREAM.to_string()),
            ],
        }
    }

    fn lookup(&self, prefix: &str) -> Option<&str> {
        self.prefixes
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn resolve(&self, qname: &[u8]) -> Result<(String, String), WireError> {
        let qname = std::str::from_utf8(qname).map_err(|e| WireError::Text(e.to_string()))?;
        match qname.split_once(':') {
            Some((prefix, local)) => {
                let uri = self
                    .lookup(prefix)
                    .ok_or_else(|| WireError::UnboundPrefix(prefix.to_string()))?;
                Ok((local.to_string(), uri.to_string()))
            }
            None => Ok((qname.to_string(), self.default_ns.clone())),
        }
    }
}

enum Scan {
    Incomplete,
    Skip(usize),
    Frame(Frame, usize),
}

/// Incremental decoder for an inbound XML stream
#[derive(Debug)]
pub struct StreamDecoder {
    registry: Arc<ExtensionRegistry>,
    max_element_size: usize,
    scope: Scope,
}

impl StreamDecoder {
    /// Create a decoder that resolves extensions through `registry`
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            registry,
            max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
            scope: Scope::stream_level(),
        }
    }

    /// Override the per-element size limit
    pub fn with_max_element_size(mut self, max: usize) -> Self {
        self.max_element_size = max;
        self
    }

    /// Forget namespace declarations of the previous stream header
    pub fn reset(&mut self) {
        self.scope = Scope::stream_level();
    }

    /// Decode one top-level item from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        loop {
            // Whitespace between elements is keepalive traffic
            match buf.iter().position(|b| !b.is_ascii_whitespace()) {
                Some(n) => buf.advance(n),
                None => {
                    buf.clear();
                    return Ok(None);
                }
            }

            match self.scan(&buf[..])? {
                Scan::Incomplete => {
                    if buf.len() > self.max_element_size {
                        return Err(WireError::Size(buf.len()));
                    }
                    return Ok(None);
                }
                Scan::Skip(consumed) => {
                    buf.advance(consumed);
                }
                Scan::Frame(frame, consumed) => {
                    trace!("Decoded {} ({} bytes)", frame.name(), consumed);
                    buf.advance(consumed);
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn scan(&mut self, data: &[u8]) -> Result<Scan, WireError> {
        let mut reader = Reader::from_reader(data);
        reader.config_mut().trim_text(false);
        // The stream's own closing tag arrives with nothing open, so end names are
        // matched against `stack` here instead
        reader.config_mut().check_end_names = false;
        reader.config_mut().allow_unmatched_ends = true;

        let mut stack: Vec<(Element, Scope, String)> = Vec::new();

        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(quick_xml::Error::Syntax(e)) if is_truncated(&e, data) => {
                    return Ok(Scan::Incomplete)
                }
                Err(e) => return Err(WireError::Xml(e.to_string())),
            };
            let position = reader.buffer_position() as usize;

            match event {
                Event::Start(e) => {
                    let parent = stack.last().map(|(_, s, _)| s).unwrap_or(&self.scope);
                    let (el, scope) = open_element(&e, parent)?;
                    if stack.is_empty() && el.is("stream", ns::STREAM) {
                        let header = StreamHeader::from_element(&el, &scope.default_ns);
                        self.scope = scope;
                        return Ok(Scan::Frame(Frame::StreamOpen(header), position));
                    }
                    let qname = qname_str(e.name().as_ref())?;
                    stack.push((el, scope, qname));
                }
                Event::Empty(e) => {
                    let parent = stack.last().map(|(_, s, _)| s).unwrap_or(&self.scope);
                    let (el, _) = open_element(&e, parent)?;
                    match stack.last_mut() {
                        Some((top, _, _)) => top.push_child(el),
                        None => return Ok(Scan::Frame(self.classify(el)?, position)),
                    }
                }
                Event::End(e) => {
                    let closing = qname_str(e.name().as_ref())?;
                    match stack.pop() {
                        // End tag with nothing open is the stream's own closing tag
                        None => {
                            if self.scope.resolve(closing.as_bytes())?
                                != ("stream".to_string(), ns::STREAM.to_string())
                            {
                                return Err(WireError::Xml(format!(
                                    "unexpected end tag </{}> at stream level",
                                    closing
                                )));
                            }
                            return Ok(Scan::Frame(Frame::StreamClose, position));
                        }
                        Some((_, _, opened)) if opened != closing => {
                            return Err(WireError::Xml(format!(
                                "end tag </{}> does not match <{}>",
                                closing, opened
                            )));
                        }
                        Some((el, _, _)) => match stack.last_mut() {
                            Some((top, _, _)) => top.push_child(el),
                            None => return Ok(Scan::Frame(self.classify(el)?, position)),
                        },
                    }
                }
                Event::Text(t) => {
                    let text = match t.unescape() {
                        Ok(text) => text,
                        Err(_) if position >= data.len() => return Ok(Scan::Incomplete),
                        Err(e) => return Err(WireError::Text(e.to_string())),
                    };
                    match stack.last_mut() {
                        Some((top, _, _)) => top.push_text(text.into_owned()),
                        None if text.trim().is_empty() => return Ok(Scan::Skip(position)),
                        None => return Err(WireError::StrayText),
                    }
                }
                Event::CData(c) => {
                    let text = String::from_utf8(c.into_inner().into_owned())
                        .map_err(|e| WireError::Text(e.to_string()))?;
                    match stack.last_mut() {
                        Some((top, _, _)) => top.push_text(text),
                        None => return Err(WireError::StrayText),
                    }
                }
                Event::Eof => return Ok(Scan::Incomplete),
                // Declarations, comments and processing instructions carry nothing
                _ => {
                    if stack.is_empty() {
                        return Ok(Scan::Skip(position));
                    }
                }
            }
        }
    }

    fn classify(&self, el: Element) -> Result<Frame, WireError> {
        if el.namespace() == ns::FRAMING {
            match el.name() {
                "open" => {
                    return Ok(Frame::StreamOpen(StreamHeader::from_element(&el, ns::CLIENT)));
                }
                "close" => return Ok(Frame::StreamClose),
                _ => {}
            }
        }
        if el.namespace() == ns::CLIENT && StanzaKind::from_element_name(el.name()).is_some() {
            return Ok(Frame::Stanza(Stanza::from_element(el, &self.registry)?));
        }
        Ok(Frame::Nonza(Nonza::from_element(el)?))
    }
}

/// Syntax errors that more input can still resolve
fn is_truncated(error: &SyntaxError, data: &[u8]) -> bool {
    match error {
        SyntaxError::UnclosedTag
        | SyntaxError::UnclosedComment
        | SyntaxError::UnclosedCData
        | SyntaxError::UnclosedDoctype
        | SyntaxError::UnclosedPIOrXmlDecl => true,
        // `<!` split from the byte that says what it opens
        SyntaxError::InvalidBangMarkup => data.ends_with(b"<!"),
    }
}

fn qname_str(raw: &[u8]) -> Result<String, WireError> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| WireError::Text(e.to_string()))
}

fn open_element(e: &BytesStart<'_>, parent: &Scope) -> Result<(Element, Scope), WireError> {
    let mut scope = parent.clone();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| WireError::Xml(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| WireError::Text(e.to_string()))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| WireError::Text(e.to_string()))?
            .into_owned();
        if key == "xmlns" {
            scope.default_ns = value;
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.prefixes.push((prefix.to_string(), value));
        } else {
            attrs.push((key, value));
        }
    }
    let (local, namespace) = scope.resolve(e.name().as_ref())?;
    let mut el = Element::new(local, namespace);
    for (k, v) in attrs {
        el.set_attr(k, v);
    }
    Ok((el, scope))
}

/// Serialiser for outbound stream items
#[derive(Debug, Clone, Copy)]
pub struct StreamEncoder {
    framing: Framing,
}

impl StreamEncoder {
    /// Create an encoder for the given framing
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    /// Framing in use
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Encode one item
    pub fn encode(&self, frame: &Frame) -> Bytes {
        let mut out = String::new();
        match (frame, self.framing) {
            (Frame::StreamOpen(header), Framing::Stream) => {
                out.push_str("<?xml version='1.0'?><stream:stream xmlns='");
                out.push_str(&header.content_ns);
                out.push_str("' xmlns:stream='");
                out.push_str(ns::STREAM);
                out.push('\'');
                header.write_attrs(&mut out);
                out.push('>');
            }
            (Frame::StreamOpen(header), Framing::WebSocket) => {
                out.push_str("<open xmlns='");
                out.push_str(ns::FRAMING);
                out.push('\'');
                header.write_attrs(&mut out);
                out.push_str("/>");
            }
            (Frame::StreamClose, Framing::Stream) => out.push_str("</stream:stream>"),
            (Frame::StreamClose, Framing::WebSocket) => {
                out.push_str("<close xmlns='");
                out.push_str(ns::FRAMING);
                out.push_str("'/>");
            }
            (Frame::Stanza(stanza), framing) => {
                stanza
                    .to_element()
                    .write_to(&mut out, self.parent_ns(framing));
            }
            (Frame::Nonza(nonza), framing) => {
                nonza
                    .to_element()
                    .write_to(&mut out, self.parent_ns(framing));
            }
        }
        Bytes::from(out)
    }

    fn parent_ns(&self, framing: Framing) -> &'static str {
        match framing {
            Framing::Stream => ns::CLIENT,
            Framing::WebSocket => "",
        }
    }
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new(Framing::Stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVER_HEADER: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
        id='c2s-1' from='example.com' version='1.0' xml:lang='en'>";

    fn decoder() -> StreamDecoder {
        StreamDecoder::new(Arc::new(ExtensionRegistry::new()))
    }

    fn decode_all(decoder: &mut StreamDecoder, buf: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_header_features_and_close() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from(SERVER_HEADER);
        buf.extend_from_slice(
            b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
              <sm xmlns='urn:xmpp:sm:3'/></stream:features>  </stream:stream>",
        );

        let frames = decode_all(&mut decoder, &mut buf);
        assert_eq!(frames.len(), 3);
        match &frames[0] {
            Frame::StreamOpen(header) => {
                assert_eq!(header.id.as_deref(), Some("c2s-1"));
                assert_eq!(header.from.as_deref(), Some("example.com"));
                assert_eq!(header.lang.as_deref(), Some("en"));
                assert_eq!(header.content_ns, ns::CLIENT);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &frames[1] {
            Frame::Nonza(Nonza::Features(features)) => {
                assert!(features.bind);
                assert!(features.stream_management);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(frames[2], Frame::StreamClose);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_input_is_retained() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from(SERVER_HEADER);
        assert!(matches!(decoder.decode(&mut buf), Ok(Some(Frame::StreamOpen(_)))));

        let stanza = b"<message id='m1' to='a@example.com'><body>fish &amp; chips</body></message>";
        // Feed byte by byte, including the split inside the entity
        for (i, byte) in stanza.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = decoder.decode(&mut buf).unwrap();
            if i + 1 < stanza.len() {
                assert!(result.is_none(), "early frame at byte {}", i);
            } else {
                match result {
                    Some(Frame::Stanza(s)) => {
                        assert_eq!(s.id(), Some("m1"));
                        assert_eq!(s.body().as_deref(), Some("fish & chips"));
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_whitespace_keepalive_ignored() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from(" \n \t ");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        buf.extend_from_slice(b"  <r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::Nonza(Nonza::SmAckRequest))
        );
    }

    #[test]
    fn test_stanza_inherits_stream_namespace() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from(SERVER_HEADER);
        buf.extend_from_slice(b"<iq type='result' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>u@example.com/r</jid></bind></iq>");

        let frames = decode_all(&mut decoder, &mut buf);
        match &frames[1] {
            Frame::Stanza(iq) => {
                assert_eq!(iq.kind(), StanzaKind::Iq);
                let bind = iq.extension("bind", ns::BIND).unwrap();
                assert_eq!(
                    bind.element().get_child("jid", ns::BIND).unwrap().text(),
                    "u@example.com/r"
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_size_limit() {
        let mut decoder = decoder().with_max_element_size(64);
        let mut buf = BytesMut::from(&b"<message><body>"[..]);
        buf.extend_from_slice(&[b'x'; 100]);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Size(115)));
    }

    #[test]
    fn test_stray_text_rejected() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from("hello<r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(decoder.decode(&mut buf), Err(WireError::StrayText));
    }

    #[test]
    fn test_malformed_markup_is_an_error() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from(SERVER_HEADER);
        assert!(matches!(decoder.decode(&mut buf), Ok(Some(Frame::StreamOpen(_)))));

        buf.extend_from_slice(b"<!bogus>");
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Xml(_))));

        // A later well-formed stanza does not hide the broken markup
        buf.extend_from_slice(b"<message id='m'/>");
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Xml(_))));
    }

    #[test]
    fn test_split_bang_markup_waits_for_more() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from("<!");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"-- keepalive --><r xmlns='urn:xmpp:sm:3'/>");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(Frame::Nonza(Nonza::SmAckRequest))
        );
    }

    #[test]
    fn test_mismatched_end_tag_rejected() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from("<message id='m'><body>hi</nope></message>");
        match decoder.decode(&mut buf) {
            Err(WireError::Xml(msg)) => assert!(msg.contains("nope"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }

        let mut buf = BytesMut::from("</presence>");
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Xml(_))));
    }

    #[test]
    fn test_unbound_prefix_rejected() {
        let mut decoder = decoder();
        let mut buf = BytesMut::from("<foo:bar/>");
        assert_eq!(
            decoder.decode(&mut buf),
            Err(WireError::UnboundPrefix("foo".to_string()))
        );
    }

    #[test]
    fn test_websocket_framing() {
        let encoder = StreamEncoder::new(Framing::WebSocket);
        let open = encoder.encode(&Frame::StreamOpen(StreamHeader::client("example.com")));
        assert_eq!(
            &open[..],
            b"<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='example.com' version='1.0'/>"
        );

        let stanza = Stanza::presence().id("p1").build();
        let bytes = encoder.encode(&Frame::Stanza(stanza.clone()));
        assert_eq!(&bytes[..], b"<presence xmlns='jabber:client' id='p1'/>");

        let mut decoder = decoder();
        let mut buf = BytesMut::from(&open[..]);
        buf.extend_from_slice(&bytes);
        buf.extend_from_slice(&encoder.encode(&Frame::StreamClose));
        let frames = decode_all(&mut decoder, &mut buf);
        assert!(matches!(&frames[0], Frame::StreamOpen(h) if h.to.as_deref() == Some("example.com")));
        assert_eq!(frames[1], Frame::Stanza(stanza));
        assert_eq!(frames[2], Frame::StreamClose);
    }

    #[test]
    fn test_stanza_round_trip() {
        let encoder = StreamEncoder::default();
        let mut decoder = decoder();
        let stanzas = vec![
            Stanza::message()
                .id("s1")
                .from("romeo@example.net/orchard")
                .to("juliet@example.com")
                .stanza_type("chat")
                .body("<3 'quoted' & \"double\"")
                .build(),
            Stanza::presence().id("s2").stanza_type("unavailable").build(),
            Stanza::iq("get").id("s3").to("example.com").build(),
            Stanza::message().no_id().lang("fr").build(),
        ];

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoder.encode(&Frame::StreamOpen(StreamHeader::client("example.com"))));
        for stanza in &stanzas {
            buf.extend_from_slice(&encoder.encode(&Frame::Stanza(stanza.clone())));
        }

        let frames = decode_all(&mut decoder, &mut buf);
        assert!(matches!(frames[0], Frame::StreamOpen(_)));
        let decoded: Vec<Stanza> = frames[1..]
            .iter()
            .map(|f| match f {
                Frame::Stanza(s) => s.clone(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(decoded, stanzas);
    }

    #[test]
    fn test_nonza_encoding() {
        let encoder = StreamEncoder::default();
        assert_eq!(
            &encoder.encode(&Frame::Nonza(Nonza::SmAck { h: 3 }))[..],
            b"<a xmlns='urn:xmpp:sm:3' h='3'/>"
        );
        assert_eq!(
            &encoder.encode(&Frame::Nonza(Nonza::SmEnable { resume: true, max: None }))[..],
            b"<enable xmlns='urn:xmpp:sm:3' resume='true'/>"
        );
        assert_eq!(&encoder.encode(&Frame::StreamClose)[..], b"</stream:stream>");
    }
}
