//! Top-level items of an XML stream.

use crate::element::Element;
use crate::nonza::Nonza;
use crate::ns;
use crate::stanza::Stanza;

/// Attributes of `<stream:stream>` or the WebSocket `<open/>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Addressed domain
    pub to: Option<String>,
    /// Sending domain
    pub from: Option<String>,
    /// Stream id assigned by the server
    pub id: Option<String>,
    /// Protocol version, `1.0` for modern streams
    pub version: Option<String>,
    /// Default language
    pub lang: Option<String>,
    /// Default content namespace
    pub content_ns: String,
}

impl StreamHeader {
    /// Header a client sends to open a stream to `domain`
    pub fn client(domain: impl Into<String>) -> Self {
        Self {
            to: Some(domain.into()),
            from: None,
            id: None,
            version: Some("1.0".to_string()),
            lang: None,
            content_ns: ns::CLIENT.to_string(),
        }
    }

    /// Set the language
    pub fn with_lang(mut self, lang: Option<String>) -> Self {
        self.lang = lang;
        self
    }

    pub(crate) fn from_element(el: &Element, content_ns: &str) -> Self {
        Self {
            to: el.attr("to").map(str::to_string),
            from: el.attr("from").map(str::to_string),
            id: el.attr("id").map(str::to_string),
            version: el.attr("version").map(str::to_string),
            lang: el.attr("xml:lang").map(str::to_string),
            content_ns: content_ns.to_string(),
        }
    }

    pub(crate) fn write_attrs(&self, out: &mut String) {
        let attrs = [
            ("to", &self.to),
            ("from", &self.from),
            ("id", &self.id),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ];
        for (name, value) in attrs {
            if let Some(value) = value {
                out.push(' ');
                out.push_str(name);
                out.push_str("='");
                out.push_str(&quick_xml::escape::escape(value.as_str()));
                out.push('\'');
            }
        }
    }
}

/// One decoded top-level item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Stream opened (or restarted)
    StreamOpen(StreamHeader),
    /// Stream closed by the peer
    StreamClose,
    /// Message, presence or iq
    Stanza(Stanza),
    /// Any other top-level element
    Nonza(Nonza),
}

impl Frame {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Frame::StreamOpen(_) => "stream-open",
            Frame::StreamClose => "stream-close",
            Frame::Stanza(s) => s.kind().element_name(),
            Frame::Nonza(n) => n.name(),
        }
    }
}

impl From<Stanza> for Frame {
    fn from(stanza: Stanza) -> Self {
        Frame::Stanza(stanza)
    }
}

impl From<Nonza> for Frame {
    fn from(nonza: Nonza) -> Self {
        Frame::Nonza(nonza)
    }
}
