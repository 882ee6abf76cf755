//! Namespaced XML element tree.
//!
//! Every top-level item on the stream is parsed into an [`Element`] before it is
//! classified. Elements keep attributes in document order and merge adjacent text
//! so that a parsed tree compares equal to the tree it was serialised from.

use quick_xml::escape::escape;
use std::fmt;

/// A child of an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Nested element
    Element(Element),
    /// Character data, unescaped
    Text(String),
}

/// XML element with a resolved namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    namespace: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an empty element
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add or replace an attribute
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Add an attribute only when a value is present
    pub fn with_opt_attr(self, name: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.with_attr(name, value),
            None => self,
        }
    }

    /// Append a child element
    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    /// Append character data
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text);
        self
    }

    /// Local name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace URI
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True if the element has this name and namespace
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    /// Attribute value by qualified name
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// All attributes in document order
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set an attribute, replacing an existing value in place
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    /// Append a child element
    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Append character data, merging with preceding text
    pub fn push_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(&text);
        } else {
            self.children.push(Node::Text(text));
        }
    }

    /// Child nodes including text
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements only
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child with the given name and namespace
    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, namespace))
    }

    /// True if a child with the given name and namespace exists
    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.get_child(name, namespace).is_some()
    }

    /// Concatenated direct character data
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Serialise, declaring `xmlns` only where it differs from `parent_ns`
    pub fn write_to(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.namespace != parent_ns {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.namespace.as_str()));
            out.push('\'');
        }
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(el) => el.write_to(out, &self.namespace),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Serialise relative to an enclosing default namespace
    pub fn to_xml(&self, parent_ns: &str) -> String {
        let mut out = String::new();
        self.write_to(&mut out, parent_ns);
        out
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_inherits_namespace() {
        let el = Element::new("message", "jabber:client")
            .with_attr("to", "juliet@example.com")
            .with_child(Element::new("body", "jabber:client").with_text("a < b & c"));

        assert_eq!(
            el.to_xml("jabber:client"),
            "<message to='juliet@example.com'><body>a &lt; b &amp; c</body></message>"
        );
        assert_eq!(
            el.to_string(),
            "<message xmlns='jabber:client' to='juliet@example.com'><body>a &lt; b &amp; c</body></message>"
        );
    }

    #[test]
    fn test_foreign_child_declares_namespace() {
        let el = Element::new("iq", "jabber:client")
            .with_child(Element::new("ping", "urn:xmpp:ping"));
        assert_eq!(
            el.to_xml("jabber:client"),
            "<iq><ping xmlns='urn:xmpp:ping'/></iq>"
        );
    }

    #[test]
    fn test_text_merging_and_lookup() {
        let mut el = Element::new("jid", "urn:ietf:params:xml:ns:xmpp-bind");
        el.push_text("user@");
        el.push_text("example.com");
        assert_eq!(el.nodes().len(), 1);
        assert_eq!(el.text(), "user@example.com");

        let parent = Element::new("bind", "urn:ietf:params:xml:ns:xmpp-bind").with_child(el);
        assert!(parent.has_child("jid", "urn:ietf:params:xml:ns:xmpp-bind"));
        assert!(!parent.has_child("jid", "jabber:client"));
    }

    #[test]
    fn test_set_attr_replaces() {
        let mut el = Element::new("a", "urn:xmpp:sm:3").with_attr("h", "1");
        el.set_attr("h", "2");
        assert_eq!(el.attr("h"), Some("2"));
        assert_eq!(el.attrs().count(), 1);
    }
}
