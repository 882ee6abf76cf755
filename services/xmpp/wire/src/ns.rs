//! Namespace URIs used on the stream.

/// Client stream content namespace
pub const CLIENT: &str = "jabber:client";
/// Stream prefix namespace
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// WebSocket framing (RFC 7395)
pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
/// STARTTLS
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// SASL
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// Resource binding
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Legacy session establishment
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// Stream management (XEP-0198)
pub const SM: &str = "urn:xmpp:sm:3";
/// Stream error conditions
pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// Stanza error conditions
pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// Reserved `xml` prefix
pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
