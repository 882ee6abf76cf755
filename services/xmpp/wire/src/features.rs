//! `<stream:features/>` parsing.

use crate::element::Element;
use crate::ns;

/// What the server offers after a stream (re)start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// STARTTLS offered; `Some(true)` when marked required
    pub starttls: Option<bool>,
    /// SASL mechanisms in server order
    pub mechanisms: Vec<String>,
    /// Resource binding offered
    pub bind: bool,
    /// Legacy session offered; `Some(true)` when not marked optional
    pub session: Option<bool>,
    /// Stream management offered
    pub stream_management: bool,
    /// Features this crate does not interpret
    pub other: Vec<Element>,
}

impl StreamFeatures {
    /// Parse the children of a features element
    pub fn from_element(el: &Element) -> Self {
        let mut features = StreamFeatures::default();
        for child in el.children() {
            match (child.name(), child.namespace()) {
                ("starttls", ns::TLS) => {
                    features.starttls = Some(child.has_child("required", ns::TLS));
                }
                ("mechanisms", ns::SASL) => {
                    features.mechanisms = child
                        .children()
                        .filter(|m| m.is("mechanism", ns::SASL))
                        .map(|m| m.text().trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect();
                }
                ("bind", ns::BIND) => features.bind = true,
                ("session", ns::SESSION) => {
                    features.session = Some(!child.has_child("optional", ns::SESSION));
                }
                ("sm", ns::SM) => features.stream_management = true,
                _ => features.other.push(child.clone()),
            }
        }
        features
    }

    /// Render as a features element
    pub fn to_element(&self) -> Element {
        let mut el = Element::new("features", ns::STREAM);
        if let Some(required) = self.starttls {
            let mut starttls = Element::new("starttls", ns::TLS);
            if required {
                starttls.push_child(Element::new("required", ns::TLS));
            }
            el.push_child(starttls);
        }
        if !self.mechanisms.is_empty() {
            let mut mechanisms = Element::new("mechanisms", ns::SASL);
            for m in &self.mechanisms {
                mechanisms.push_child(Element::new("mechanism", ns::SASL).with_text(m.clone()));
            }
            el.push_child(mechanisms);
        }
        if self.bind {
            el.push_child(Element::new("bind", ns::BIND));
        }
        if let Some(required) = self.session {
            let mut session = Element::new("session", ns::SESSION);
            if !required {
                session.push_child(Element::new("optional", ns::SESSION));
            }
            el.push_child(session);
        }
        if self.stream_management {
            el.push_child(Element::new("sm", ns::SM));
        }
        for other in &self.other {
            el.push_child(other.clone());
        }
        el
    }

    /// True if STARTTLS is offered and marked required
    pub fn starttls_required(&self) -> bool {
        self.starttls == Some(true)
    }

    /// True if the server demands legacy session establishment
    pub fn session_required(&self) -> bool {
        self.session == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_features() {
        let el = Element::new("features", ns::STREAM)
            .with_child(
                Element::new("starttls", ns::TLS).with_child(Element::new("required", ns::TLS)),
            )
            .with_child(
                Element::new("mechanisms", ns::SASL)
                    .with_child(Element::new("mechanism", ns::SASL).with_text("SCRAM-SHA-1"))
                    .with_child(Element::new("mechanism", ns::SASL).with_text("PLAIN")),
            )
            .with_child(Element::new("ver", "urn:xmpp:features:rosterver"));

        let features = StreamFeatures::from_element(&el);
        assert!(features.starttls_required());
        assert_eq!(features.mechanisms, vec!["SCRAM-SHA-1", "PLAIN"]);
        assert!(!features.bind);
        assert_eq!(features.other.len(), 1);
    }

    #[test]
    fn test_session_optional() {
        let el = Element::new("features", ns::STREAM)
            .with_child(Element::new("bind", ns::BIND))
            .with_child(
                Element::new("session", ns::SESSION)
                    .with_child(Element::new("optional", ns::SESSION)),
            )
            .with_child(Element::new("sm", ns::SM));

        let features = StreamFeatures::from_element(&el);
        assert!(features.bind);
        assert!(!features.session_required());
        assert!(features.stream_management);
        assert_eq!(StreamFeatures::from_element(&features.to_element()), features);
    }
}
