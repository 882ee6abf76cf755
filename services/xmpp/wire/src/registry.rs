//! Extension registry: structured decoding of stanza child elements.
//!
//! The registry is an explicit object handed to the decoder at construction time.
//! Decoders are keyed by element name and namespace; anything without a decoder
//! (or whose decoder rejects it) stays in the stanza as an opaque element.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::element::Element;
use crate::error::WireError;

/// Decoded form of a stanza extension
pub trait ExtensionPayload: fmt::Debug + Send + Sync + 'static {
    /// Access for downcasting to the concrete payload type
    fn as_any(&self) -> &dyn Any;

    /// Render back into an element tree
    fn to_element(&self) -> Element;
}

/// Decoder for one element name + namespace
pub trait ExtensionDecoder: Send + Sync {
    /// Decode an element tree into a payload
    fn decode(&self, element: &Element) -> Result<Arc<dyn ExtensionPayload>, WireError>;
}

impl<F> ExtensionDecoder for F
where
    F: Fn(&Element) -> Result<Arc<dyn ExtensionPayload>, WireError> + Send + Sync,
{
    fn decode(&self, element: &Element) -> Result<Arc<dyn ExtensionPayload>, WireError> {
        self(element)
    }
}

/// One child element of a stanza
#[derive(Clone)]
pub struct Extension {
    element: Element,
    payload: Option<Arc<dyn ExtensionPayload>>,
}

impl Extension {
    /// Opaque extension, no decoded form
    pub fn opaque(element: Element) -> Self {
        Self {
            element,
            payload: None,
        }
    }

    /// Extension built from a typed payload
    pub fn from_payload(payload: Arc<dyn ExtensionPayload>) -> Self {
        Self {
            element: payload.to_element(),
            payload: Some(payload),
        }
    }

    /// Element local name
    pub fn name(&self) -> &str {
        self.element.name()
    }

    /// Element namespace
    pub fn namespace(&self) -> &str {
        self.element.namespace()
    }

    /// Raw element tree
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Decoded payload of a specific type, if the registry produced one
    pub fn payload<T: ExtensionPayload>(&self) -> Option<&T> {
        self.payload
            .as_deref()
            .and_then(|p| p.as_any().downcast_ref::<T>())
    }

    /// True if the registry decoded this extension
    pub fn is_decoded(&self) -> bool {
        self.payload.is_some()
    }
}

impl PartialEq for Extension {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element
    }
}

impl Eq for Extension {}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("element", &self.element.to_string())
            .field("decoded", &self.payload.is_some())
            .finish()
    }
}

/// Decoders keyed by (name, namespace)
#[derive(Default, Clone)]
pub struct ExtensionRegistry {
    decoders: HashMap<(String, String), Arc<dyn ExtensionDecoder>>,
}

impl ExtensionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder, replacing any previous one for the same key
    pub fn register<D>(&mut self, name: &str, namespace: &str, decoder: D)
    where
        D: ExtensionDecoder + 'static,
    {
        self.decoders
            .insert((name.to_string(), namespace.to_string()), Arc::new(decoder));
    }

    /// Find the decoder for an element name and namespace
    pub fn lookup(&self, name: &str, namespace: &str) -> Option<Arc<dyn ExtensionDecoder>> {
        self.decoders
            .get(&(name.to_string(), namespace.to_string()))
            .cloned()
    }

    /// Number of registered decoders
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Wrap an element, decoding it when a decoder is known
    pub fn decode(&self, element: Element) -> Extension {
        let Some(decoder) = self.lookup(element.name(), element.namespace()) else {
            return Extension::opaque(element);
        };
        match decoder.decode(&element) {
            Ok(payload) => Extension {
                element,
                payload: Some(payload),
            },
            Err(e) => {
                debug!(
                    "Keeping <{} xmlns='{}'> opaque: {}",
                    element.name(),
                    element.namespace(),
                    e
                );
                Extension::opaque(element)
            }
        }
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("decoders", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING_NS: &str = "urn:xmpp:ping";

    #[derive(Debug, PartialEq)]
    struct Ping;

    impl ExtensionPayload for Ping {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn to_element(&self) -> Element {
            Element::new("ping", PING_NS)
        }
    }

    fn registry() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::new();
        registry.register("ping", PING_NS, |el: &Element| {
            if el.children().next().is_some() {
                return Err(WireError::Unexpected {
                    name: el.name().to_string(),
                    namespace: el.namespace().to_string(),
                });
            }
            Ok(Arc::new(Ping) as Arc<dyn ExtensionPayload>)
        });
        registry
    }

    #[test]
    fn test_known_element_is_decoded() {
        let ext = registry().decode(Element::new("ping", PING_NS));
        assert!(ext.is_decoded());
        assert_eq!(ext.payload::<Ping>(), Some(&Ping));
    }

    #[test]
    fn test_unknown_element_kept_opaque() {
        let el = Element::new("x", "jabber:x:data").with_attr("type", "form");
        let ext = registry().decode(el.clone());
        assert!(!ext.is_decoded());
        assert_eq!(ext.element(), &el);
        assert!(ext.payload::<Ping>().is_none());
    }

    #[test]
    fn test_decoder_error_kept_opaque() {
        let el = Element::new("ping", PING_NS).with_child(Element::new("junk", PING_NS));
        let ext = registry().decode(el.clone());
        assert!(!ext.is_decoded());
        assert_eq!(ext.element(), &el);
    }
}
