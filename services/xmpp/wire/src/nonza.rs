//! Stream-level elements that are not stanzas.
//!
//! Covers the negotiation vocabulary (features, STARTTLS, SASL), stream errors
//! and the stream management elements of XEP-0198. Anything else arriving at the
//! top level is kept as [`Nonza::Other`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::element::Element;
use crate::error::WireError;
use crate::features::StreamFeatures;
use crate::ns;

/// Server reply to `<enable/>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmEnabled {
    /// Resumption token
    pub id: Option<String>,
    /// Server agreed to resumption
    pub resume: bool,
    /// Server's maximum resumption time in seconds
    pub max: Option<u32>,
    /// Preferred reconnect location
    pub location: Option<String>,
}

/// Defined condition plus optional text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCondition {
    /// Condition element name, e.g. `not-authorized`
    pub condition: String,
    /// Descriptive text
    pub text: Option<String>,
}

/// Top-level non-stanza element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nonza {
    /// `<stream:features/>`
    Features(StreamFeatures),
    /// `<stream:error/>`
    StreamError(ErrorCondition),
    /// `<starttls/>`
    StartTls,
    /// `<proceed/>`
    TlsProceed,
    /// `<failure xmlns='...tls'/>`
    TlsFailure,
    /// SASL `<auth/>`
    SaslAuth {
        /// Mechanism name
        mechanism: String,
        /// Initial response, `None` when the mechanism has none
        initial: Option<Vec<u8>>,
    },
    /// SASL `<challenge/>`
    SaslChallenge(Vec<u8>),
    /// SASL `<response/>`
    SaslResponse(Vec<u8>),
    /// SASL `<success/>` with optional additional data
    SaslSuccess(Option<Vec<u8>>),
    /// SASL `<failure/>`
    SaslFailure(ErrorCondition),
    /// SASL `<abort/>`
    SaslAbort,
    /// Stream management `<enable/>`
    SmEnable {
        /// Request resumption
        resume: bool,
        /// Preferred maximum resumption time in seconds
        max: Option<u32>,
    },
    /// Stream management `<enabled/>`
    SmEnabled(SmEnabled),
    /// Stream management `<failed/>`
    SmFailed {
        /// Error condition, if any
        condition: Option<String>,
        /// Handled count reported by the server
        h: Option<u32>,
    },
    /// Stream management `<resume/>`
    SmResume {
        /// Stanzas handled by the client
        h: u32,
        /// Token of the session to resume
        previd: String,
    },
    /// Stream management `<resumed/>`
    SmResumed {
        /// Stanzas handled by the server
        h: u32,
        /// Token of the resumed session
        previd: String,
    },
    /// Stream management `<r/>`
    SmAckRequest,
    /// Stream management `<a/>`
    SmAck {
        /// Stanzas handled by the sender
        h: u32,
    },
    /// Unrecognised top-level element
    Other(Element),
}

impl Nonza {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Nonza::Features(_) => "features",
            Nonza::StreamError(_) => "stream-error",
            Nonza::StartTls => "starttls",
            Nonza::TlsProceed => "proceed",
            Nonza::TlsFailure => "tls-failure",
            Nonza::SaslAuth { .. } => "auth",
            Nonza::SaslChallenge(_) => "challenge",
            Nonza::SaslResponse(_) => "response",
            Nonza::SaslSuccess(_) => "success",
            Nonza::SaslFailure(_) => "sasl-failure",
            Nonza::SaslAbort => "abort",
            Nonza::SmEnable { .. } => "enable",
            Nonza::SmEnabled(_) => "enabled",
            Nonza::SmFailed { .. } => "failed",
            Nonza::SmResume { .. } => "resume",
            Nonza::SmResumed { .. } => "resumed",
            Nonza::SmAckRequest => "r",
            Nonza::SmAck { .. } => "a",
            Nonza::Other(_) => "other",
        }
    }

    /// Render as an element
    pub fn to_element(&self) -> Element {
        match self {
            Nonza::Features(features) => features.to_element(),
            Nonza::StreamError(err) => {
                let mut el = Element::new("error", ns::STREAM)
                    .with_child(Element::new(err.condition.clone(), ns::STREAM_ERRORS));
                if let Some(text) = &err.text {
                    el.push_child(Element::new("text", ns::STREAM_ERRORS).with_text(text.clone()));
                }
                el
            }
            Nonza::StartTls => Element::new("starttls", ns::TLS),
            Nonza::TlsProceed => Element::new("proceed", ns::TLS),
            Nonza::TlsFailure => Element::new("failure", ns::TLS),
            Nonza::SaslAuth { mechanism, initial } => {
                let el = Element::new("auth", ns::SASL).with_attr("mechanism", mechanism.clone());
                match initial {
                    Some(data) => el.with_text(encode_payload(data)),
                    None => el,
                }
            }
            Nonza::SaslChallenge(data) => {
                Element::new("challenge", ns::SASL).with_text(encode_payload(data))
            }
            Nonza::SaslResponse(data) => {
                Element::new("response", ns::SASL).with_text(encode_payload(data))
            }
            Nonza::SaslSuccess(data) => {
                let el = Element::new("success", ns::SASL);
                match data {
                    Some(data) => el.with_text(encode_payload(data)),
                    None => el,
                }
            }
            Nonza::SaslFailure(err) => {
                let mut el = Element::new("failure", ns::SASL)
                    .with_child(Element::new(err.condition.clone(), ns::SASL));
                if let Some(text) = &err.text {
                    el.push_child(Element::new("text", ns::SASL).with_text(text.clone()));
                }
                el
            }
            Nonza::SaslAbort => Element::new("abort", ns::SASL),
            Nonza::SmEnable { resume, max } => {
                let mut el = Element::new("enable", ns::SM);
                if *resume {
                    el.set_attr("resume", "true");
                }
                el.with_opt_attr("max", max.map(|m| m.to_string()))
            }
            Nonza::SmEnabled(enabled) => {
                let mut el = Element::new("enabled", ns::SM)
                    .with_opt_attr("id", enabled.id.as_deref());
                if enabled.resume {
                    el.set_attr("resume", "true");
                }
                el.with_opt_attr("max", enabled.max.map(|m| m.to_string()))
                    .with_opt_attr("location", enabled.location.as_deref())
            }
            Nonza::SmFailed { condition, h } => {
                let el = Element::new("failed", ns::SM).with_opt_attr("h", h.map(|h| h.to_string()));
                match condition {
                    Some(c) => el.with_child(Element::new(c.clone(), ns::STANZA_ERRORS)),
                    None => el,
                }
            }
            Nonza::SmResume { h, previd } => Element::new("resume", ns::SM)
                .with_attr("h", h.to_string())
                .with_attr("previd", previd.clone()),
            Nonza::SmResumed { h, previd } => Element::new("resumed", ns::SM)
                .with_attr("h", h.to_string())
                .with_attr("previd", previd.clone()),
            Nonza::SmAckRequest => Element::new("r", ns::SM),
            Nonza::SmAck { h } => Element::new("a", ns::SM).with_attr("h", h.to_string()),
            Nonza::Other(el) => el.clone(),
        }
    }

    /// Classify a top-level element
    pub fn from_element(el: Element) -> Result<Self, WireError> {
        let nonza = match (el.namespace(), el.name()) {
            (ns::STREAM, "features") => Nonza::Features(StreamFeatures::from_element(&el)),
            (ns::STREAM, "error") => Nonza::StreamError(
                parse_condition(&el, ns::STREAM_ERRORS).unwrap_or_else(|| ErrorCondition {
                    condition: "undefined-condition".to_string(),
                    text: None,
                }),
            ),
            (ns::TLS, "starttls") => Nonza::StartTls,
            (ns::TLS, "proceed") => Nonza::TlsProceed,
            (ns::TLS, "failure") => Nonza::TlsFailure,
            (ns::SASL, "auth") => {
                let mechanism = required_attr(&el, "mechanism")?.to_string();
                let text = el.text();
                let initial = if text.trim().is_empty() {
                    None
                } else {
                    Some(decode_payload(&text)?)
                };
                Nonza::SaslAuth { mechanism, initial }
            }
            (ns::SASL, "challenge") => Nonza::SaslChallenge(decode_payload(&el.text())?),
            (ns::SASL, "response") => Nonza::SaslResponse(decode_payload(&el.text())?),
            (ns::SASL, "success") => {
                let text = el.text();
                if text.trim().is_empty() {
                    Nonza::SaslSuccess(None)
                } else {
                    Nonza::SaslSuccess(Some(decode_payload(&text)?))
                }
            }
            (ns::SASL, "failure") => Nonza::SaslFailure(
                parse_condition(&el, ns::SASL).unwrap_or_else(|| ErrorCondition {
                    condition: "not-authorized".to_string(),
                    text: None,
                }),
            ),
            (ns::SASL, "abort") => Nonza::SaslAbort,
            (ns::SM, "enable") => Nonza::SmEnable {
                resume: bool_attr(&el, "resume"),
                max: opt_u32_attr(&el, "max")?,
            },
            (ns::SM, "enabled") => Nonza::SmEnabled(SmEnabled {
                id: el.attr("id").map(str::to_string),
                resume: bool_attr(&el, "resume"),
                max: opt_u32_attr(&el, "max")?,
                location: el.attr("location").map(str::to_string),
            }),
            (ns::SM, "failed") => Nonza::SmFailed {
                condition: el.children().next().map(|c| c.name().to_string()),
                h: opt_u32_attr(&el, "h")?,
            },
            (ns::SM, "resume") => Nonza::SmResume {
                h: u32_attr(&el, "h")?,
                previd: required_attr(&el, "previd")?.to_string(),
            },
            (ns::SM, "resumed") => Nonza::SmResumed {
                h: u32_attr(&el, "h")?,
                previd: required_attr(&el, "previd")?.to_string(),
            },
            (ns::SM, "r") => Nonza::SmAckRequest,
            (ns::SM, "a") => Nonza::SmAck {
                h: u32_attr(&el, "h")?,
            },
            _ => Nonza::Other(el),
        };
        Ok(nonza)
    }
}

/// Base64 for SASL payloads; an empty payload is `=`
pub fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        "=".to_string()
    } else {
        STANDARD.encode(data)
    }
}

/// Inverse of [`encode_payload`]
pub fn decode_payload(text: &str) -> Result<Vec<u8>, WireError> {
    let text = text.trim();
    if text.is_empty() || text == "=" {
        return Ok(Vec::new());
    }
    STANDARD.decode(text).map_err(|_| WireError::Base64)
}

fn parse_condition(el: &Element, namespace: &str) -> Option<ErrorCondition> {
    let condition = el
        .children()
        .find(|c| c.namespace() == namespace && c.name() != "text")?
        .name()
        .to_string();
    let text = el.get_child("text", namespace).map(|t| t.text());
    Some(ErrorCondition { condition, text })
}

fn required_attr<'a>(el: &'a Element, attr: &str) -> Result<&'a str, WireError> {
    el.attr(attr).ok_or_else(|| WireError::Attribute {
        element: el.name().to_string(),
        attr: attr.to_string(),
    })
}

fn u32_attr(el: &Element, attr: &str) -> Result<u32, WireError> {
    required_attr(el, attr)?
        .parse()
        .map_err(|_| WireError::Attribute {
            element: el.name().to_string(),
            attr: attr.to_string(),
        })
}

fn opt_u32_attr(el: &Element, attr: &str) -> Result<Option<u32>, WireError> {
    match el.attr(attr) {
        Some(_) => u32_attr(el, attr).map(Some),
        None => Ok(None),
    }
}

fn bool_attr(el: &Element, attr: &str) -> bool {
    matches!(el.attr(attr), Some("true") | Some("1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sasl_payloads() {
        let auth = Nonza::SaslAuth {
            mechanism: "PLAIN".to_string(),
            initial: Some(b"\0user\0pencil".to_vec()),
        };
        let el = auth.to_element();
        assert_eq!(el.attr("mechanism"), Some("PLAIN"));
        assert_eq!(el.text(), "AHVzZXIAcGVuY2ls");
        assert_eq!(Nonza::from_element(el).unwrap(), auth);

        let empty = Nonza::SaslResponse(Vec::new()).to_element();
        assert_eq!(empty.text(), "=");
        assert_eq!(
            Nonza::from_element(Element::new("success", ns::SASL)).unwrap(),
            Nonza::SaslSuccess(None)
        );
    }

    #[test]
    fn test_bad_base64_rejected() {
        let el = Element::new("challenge", ns::SASL).with_text("***");
        assert_eq!(Nonza::from_element(el), Err(WireError::Base64));
    }

    #[test]
    fn test_sasl_failure_condition() {
        let el = Element::new("failure", ns::SASL)
            .with_child(Element::new("not-authorized", ns::SASL))
            .with_child(Element::new("text", ns::SASL).with_text("bad password"));
        match Nonza::from_element(el).unwrap() {
            Nonza::SaslFailure(err) => {
                assert_eq!(err.condition, "not-authorized");
                assert_eq!(err.text.as_deref(), Some("bad password"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sm_elements() {
        let enabled = Element::new("enabled", ns::SM)
            .with_attr("id", "some-long-sm-id")
            .with_attr("resume", "true")
            .with_attr("max", "300");
        assert_eq!(
            Nonza::from_element(enabled).unwrap(),
            Nonza::SmEnabled(SmEnabled {
                id: Some("some-long-sm-id".to_string()),
                resume: true,
                max: Some(300),
                location: None,
            })
        );

        let ack = Element::new("a", ns::SM).with_attr("h", "4294967295");
        assert_eq!(Nonza::from_element(ack).unwrap(), Nonza::SmAck { h: u32::MAX });

        let bad = Element::new("a", ns::SM).with_attr("h", "-1");
        assert!(matches!(
            Nonza::from_element(bad),
            Err(WireError::Attribute { .. })
        ));

        let failed = Element::new("failed", ns::SM)
            .with_attr("h", "2")
            .with_child(Element::new("item-not-found", ns::STANZA_ERRORS));
        assert_eq!(
            Nonza::from_element(failed).unwrap(),
            Nonza::SmFailed {
                condition: Some("item-not-found".to_string()),
                h: Some(2)
            }
        );
    }

    #[test]
    fn test_stream_error() {
        let el = Element::new("error", ns::STREAM)
            .with_child(Element::new("conflict", ns::STREAM_ERRORS))
            .with_child(Element::new("text", ns::STREAM_ERRORS).with_text("replaced"));
        match Nonza::from_element(el).unwrap() {
            Nonza::StreamError(err) => {
                assert_eq!(err.condition, "conflict");
                assert_eq!(err.text.as_deref(), Some("replaced"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kept() {
        let el = Element::new("handshake", "jabber:component:accept");
        assert_eq!(Nonza::from_element(el.clone()).unwrap(), Nonza::Other(el));
    }
}
