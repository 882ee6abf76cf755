//! Stanza model.
//!
//! A [`Stanza`] is immutable once built and cheap to clone: the dispatch pipeline,
//! collectors and the unacknowledged queue all hold the same shared value.

use std::fmt;
use std::sync::Arc;

use crate::element::{Element, Node};
use crate::error::WireError;
use crate::ns;
use crate::registry::{Extension, ExtensionPayload, ExtensionRegistry};

/// Kind of top-level stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
    /// `<iq/>`
    Iq,
}

impl StanzaKind {
    /// Element name on the wire
    pub fn element_name(&self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }

    /// Kind for an element name
    pub fn from_element_name(name: &str) -> Option<Self> {
        match name {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_name())
    }
}

/// Generate a fresh stanza id
pub fn next_stanza_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StanzaInner {
    kind: StanzaKind,
    id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    stanza_type: Option<String>,
    lang: Option<String>,
    attrs: Vec<(String, String)>,
    extensions: Vec<Extension>,
}

/// Immutable message, presence or iq
#[derive(Clone, PartialEq, Eq)]
pub struct Stanza(Arc<StanzaInner>);

impl Stanza {
    /// Start building a stanza of the given kind
    pub fn builder(kind: StanzaKind) -> StanzaBuilder {
        StanzaBuilder::new(kind)
    }

    /// Start building a message
    pub fn message() -> StanzaBuilder {
        StanzaBuilder::new(StanzaKind::Message)
    }

    /// Start building a presence
    pub fn presence() -> StanzaBuilder {
        StanzaBuilder::new(StanzaKind::Presence)
    }

    /// Start building an iq of the given type (`get`, `set`, `result`, `error`)
    pub fn iq(stanza_type: &str) -> StanzaBuilder {
        StanzaBuilder::new(StanzaKind::Iq).stanza_type(stanza_type)
    }

    /// Builder for a reply: same kind and id, addresses swapped
    pub fn reply(&self) -> StanzaBuilder {
        let mut builder = StanzaBuilder::new(self.kind());
        builder.inner.id = self.0.id.clone();
        builder.inner.to = self.0.from.clone();
        builder.inner.from = self.0.to.clone();
        builder.generate_id = false;
        builder
    }

    /// Builder preloaded with this stanza, for deriving a modified copy
    pub fn to_builder(&self) -> StanzaBuilder {
        StanzaBuilder {
            inner: (*self.0).clone(),
            generate_id: false,
        }
    }

    /// Error reply with a defined condition in the stanza-errors namespace
    pub fn error_reply(&self, error_type: &str, condition: &str) -> Stanza {
        let error = Element::new("error", ns::CLIENT)
            .with_attr("type", error_type)
            .with_child(Element::new(condition, ns::STANZA_ERRORS));
        self.reply().stanza_type("error").extension(error).build()
    }

    /// Stanza kind
    pub fn kind(&self) -> StanzaKind {
        self.0.kind
    }

    /// Stanza id
    pub fn id(&self) -> Option<&str> {
        self.0.id.as_deref()
    }

    /// Sender address
    pub fn from(&self) -> Option<&str> {
        self.0.from.as_deref()
    }

    /// Recipient address
    pub fn to(&self) -> Option<&str> {
        self.0.to.as_deref()
    }

    /// `type` attribute
    pub fn stanza_type(&self) -> Option<&str> {
        self.0.stanza_type.as_deref()
    }

    /// `xml:lang` attribute
    pub fn lang(&self) -> Option<&str> {
        self.0.lang.as_deref()
    }

    /// Any other attribute by qualified name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.0
            .attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Child elements in document order
    pub fn extensions(&self) -> &[Extension] {
        &self.0.extensions
    }

    /// First child element with the given name and namespace
    pub fn extension(&self, name: &str, namespace: &str) -> Option<&Extension> {
        self.0
            .extensions
            .iter()
            .find(|e| e.name() == name && e.namespace() == namespace)
    }

    /// Name and namespace of the first child element; an iq's payload
    pub fn child_qname(&self) -> Option<(&str, &str)> {
        self.0.extensions.first().map(|e| (e.name(), e.namespace()))
    }

    /// Message body text
    pub fn body(&self) -> Option<String> {
        self.extension("body", ns::CLIENT)
            .map(|e| e.element().text())
    }

    /// Defined condition of an `<error/>` child
    pub fn error_condition(&self) -> Option<&str> {
        self.extension("error", ns::CLIENT)?
            .element()
            .children()
            .find(|c| c.namespace() == ns::STANZA_ERRORS && c.name() != "text")
            .map(|c| c.name())
    }

    /// Human readable text of an `<error/>` child
    pub fn error_text(&self) -> Option<String> {
        self.extension("error", ns::CLIENT)?
            .element()
            .get_child("text", ns::STANZA_ERRORS)
            .map(|t| t.text())
    }

    /// True for `get`/`set` iqs
    pub fn is_iq_request(&self) -> bool {
        self.kind() == StanzaKind::Iq && matches!(self.stanza_type(), Some("get") | Some("set"))
    }

    /// True for `result`/`error` iqs
    pub fn is_iq_response(&self) -> bool {
        self.kind() == StanzaKind::Iq
            && matches!(self.stanza_type(), Some("result") | Some("error"))
    }

    /// Render as an element in the client namespace
    pub fn to_element(&self) -> Element {
        let inner = &self.0;
        let mut el = Element::new(inner.kind.element_name(), ns::CLIENT)
            .with_opt_attr("id", inner.id.as_deref())
            .with_opt_attr("from", inner.from.as_deref())
            .with_opt_attr("to", inner.to.as_deref())
            .with_opt_attr("type", inner.stanza_type.as_deref())
            .with_opt_attr("xml:lang", inner.lang.as_deref());
        for (k, v) in &inner.attrs {
            el.set_attr(k.clone(), v.clone());
        }
        for ext in &inner.extensions {
            el.push_child(ext.element().clone());
        }
        el
    }

    /// Parse from an element, resolving children through the registry
    pub fn from_element(el: Element, registry: &ExtensionRegistry) -> Result<Self, WireError> {
        let kind = StanzaKind::from_element_name(el.name()).ok_or_else(|| WireError::Unexpected {
            name: el.name().to_string(),
            namespace: el.namespace().to_string(),
        })?;

        let mut inner = StanzaInner {
            kind,
            id: None,
            from: None,
            to: None,
            stanza_type: None,
            lang: None,
            attrs: Vec::new(),
            extensions: Vec::new(),
        };
        for (k, v) in el.attrs() {
            match k {
                "id" => inner.id = Some(v.to_string()),
                "from" => inner.from = Some(v.to_string()),
                "to" => inner.to = Some(v.to_string()),
                "type" => inner.stanza_type = Some(v.to_string()),
                "xml:lang" => inner.lang = Some(v.to_string()),
                _ => inner.attrs.push((k.to_string(), v.to_string())),
            }
        }
        for node in el.nodes() {
            // Stanza-level character data is insignificant whitespace
            if let Node::Element(child) = node {
                inner.extensions.push(registry.decode(child.clone()));
            }
        }
        Ok(Stanza(Arc::new(inner)))
    }
}

impl fmt::Debug for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = &self.0;
        f.debug_struct("Stanza")
            .field("kind", &inner.kind)
            .field("id", &inner.id)
            .field("from", &inner.from)
            .field("to", &inner.to)
            .field("type", &inner.stanza_type)
            .field("extensions", &inner.extensions.len())
            .finish()
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_element().to_xml(ns::CLIENT))
    }
}

/// Builder for [`Stanza`]
#[derive(Debug, Clone)]
pub struct StanzaBuilder {
    inner: StanzaInner,
    generate_id: bool,
}

impl StanzaBuilder {
    /// Create a builder; an id is generated at build time unless set or suppressed
    pub fn new(kind: StanzaKind) -> Self {
        Self {
            inner: StanzaInner {
                kind,
                id: None,
                from: None,
                to: None,
                stanza_type: None,
                lang: None,
                attrs: Vec::new(),
                extensions: Vec::new(),
            },
            generate_id: true,
        }
    }

    /// Set the id
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.inner.id = Some(id.into());
        self
    }

    /// Build without any id
    pub fn no_id(mut self) -> Self {
        self.inner.id = None;
        self.generate_id = false;
        self
    }

    /// Set the sender
    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.inner.from = Some(from.into());
        self
    }

    /// Set the recipient
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.inner.to = Some(to.into());
        self
    }

    /// Set the `type` attribute
    pub fn stanza_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.inner.stanza_type = Some(stanza_type.into());
        self
    }

    /// Set `xml:lang`
    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.inner.lang = Some(lang.into());
        self
    }

    /// Set any other attribute
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.inner.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.inner.attrs.push((name, value)),
        }
        self
    }

    /// Append a `<body/>`
    pub fn body(self, text: impl Into<String>) -> Self {
        self.extension(Element::new("body", ns::CLIENT).with_text(text))
    }

    /// Append an opaque child element
    pub fn extension(mut self, element: Element) -> Self {
        self.inner.extensions.push(Extension::opaque(element));
        self
    }

    /// Append a typed payload
    pub fn payload(mut self, payload: Arc<dyn ExtensionPayload>) -> Self {
        self.inner.extensions.push(Extension::from_payload(payload));
        self
    }

    /// Freeze into a stanza
    pub fn build(mut self) -> Stanza {
        if self.inner.id.is_none() && self.generate_id {
            self.inner.id = Some(next_stanza_id());
        }
        Stanza(Arc::new(self.inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_generates_ids() {
        let a = Stanza::message().to("juliet@example.com").build();
        let b = Stanza::message().to("juliet@example.com").build();
        assert!(a.id().is_some());
        assert_ne!(a.id(), b.id());

        let c = Stanza::presence().no_id().build();
        assert_eq!(c.id(), None);
    }

    #[test]
    fn test_element_round_trip() {
        let stanza = Stanza::message()
            .id("m1")
            .to("juliet@example.com/balcony")
            .from("romeo@example.net/orchard")
            .stanza_type("chat")
            .lang("en")
            .attr("custom", "1")
            .body("Art thou not Romeo?")
            .build();

        let parsed = Stanza::from_element(stanza.to_element(), &ExtensionRegistry::new()).unwrap();
        assert_eq!(parsed, stanza);
        assert_eq!(parsed.body().as_deref(), Some("Art thou not Romeo?"));
        assert_eq!(parsed.attr("custom"), Some("1"));
    }

    #[test]
    fn test_error_condition() {
        let error = Element::new("error", ns::CLIENT)
            .with_attr("type", "cancel")
            .with_child(Element::new("item-not-found", ns::STANZA_ERRORS))
            .with_child(Element::new("text", ns::STANZA_ERRORS).with_text("gone"));
        let stanza = Stanza::iq("error").id("q1").extension(error).build();

        assert!(stanza.is_iq_response());
        assert!(!stanza.is_iq_request());
        assert_eq!(stanza.error_condition(), Some("item-not-found"));
        assert_eq!(stanza.error_text().as_deref(), Some("gone"));
    }

    #[test]
    fn test_reply_swaps_addresses() {
        let request = Stanza::iq("get")
            .id("q7")
            .from("a@example.com/r")
            .to("example.com")
            .build();
        let reply = request.reply().stanza_type("result").build();
        assert_eq!(reply.id(), Some("q7"));
        assert_eq!(reply.to(), Some("a@example.com/r"));
        assert_eq!(reply.from(), Some("example.com"));
    }

    #[test]
    fn test_to_builder_keeps_fields() {
        let original = Stanza::message().id("m1").to("bob@example.com").body("hi").build();
        let copy = original.to_builder().lang("en").build();
        assert_eq!(copy.id(), Some("m1"));
        assert_eq!(copy.body().as_deref(), Some("hi"));
        assert_eq!(copy.lang(), Some("en"));
        assert_eq!(original.lang(), None);
    }

    #[test]
    fn test_error_reply() {
        let request = Stanza::iq("get")
            .id("v1")
            .from("example.com")
            .extension(Element::new("query", "jabber:iq:version"))
            .build();
        assert_eq!(request.child_qname(), Some(("query", "jabber:iq:version")));

        let reply = request.error_reply("cancel", "service-unavailable");
        assert!(reply.is_iq_response());
        assert_eq!(reply.id(), Some("v1"));
        assert_eq!(reply.to(), Some("example.com"));
        assert_eq!(reply.error_condition(), Some("service-unavailable"));
        assert_eq!(
            reply.extension("error", ns::CLIENT).and_then(|e| e.element().attr("type")),
            Some("cancel")
        );
    }

    #[test]
    fn test_unknown_element_name_rejected() {
        let err = Stanza::from_element(Element::new("auth", ns::SASL), &ExtensionRegistry::new())
            .unwrap_err();
        assert!(matches!(err, WireError::Unexpected { .. }));
    }
}
