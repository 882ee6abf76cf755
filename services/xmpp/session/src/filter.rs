//! Composable stanza predicates.

use std::fmt;
use std::sync::Arc;
use xmpp_wire::{Stanza, StanzaKind};

/// Pure predicate over a [`Stanza`]
#[derive(Clone)]
pub enum StanzaFilter {
    /// Matches everything
    Any,
    /// Element kind
    Kind(StanzaKind),
    /// Exact `id`
    Id(String),
    /// Exact `from`
    From(String),
    /// Exact `type`
    Type(String),
    /// Carries a child with this name and namespace
    Extension {
        /// Element name
        name: String,
        /// Namespace
        namespace: String,
    },
    /// Both match
    And(Box<StanzaFilter>, Box<StanzaFilter>),
    /// Either matches
    Or(Box<StanzaFilter>, Box<StanzaFilter>),
    /// Inverse
    Not(Box<StanzaFilter>),
    /// Arbitrary closure
    Custom(Arc<dyn Fn(&Stanza) -> bool + Send + Sync>),
}

impl StanzaFilter {
    /// Match every stanza
    pub fn any() -> Self {
        StanzaFilter::Any
    }

    /// Match one stanza kind
    pub fn kind(kind: StanzaKind) -> Self {
        StanzaFilter::Kind(kind)
    }

    /// Match by id
    pub fn id(id: impl Into<String>) -> Self {
        StanzaFilter::Id(id.into())
    }

    /// Match by sender
    pub fn from(from: impl Into<String>) -> Self {
        StanzaFilter::From(from.into())
    }

    /// Match by `type` attribute
    pub fn stanza_type(stanza_type: impl Into<String>) -> Self {
        StanzaFilter::Type(stanza_type.into())
    }

    /// Match stanzas carrying an extension
    pub fn extension(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        StanzaFilter::Extension {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Match with a closure
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Stanza) -> bool + Send + Sync + 'static,
    {
        StanzaFilter::Custom(Arc::new(f))
    }

    /// Replies to an iq request: same id, type result or error
    ///
    /// When the request was addressed, the reply must come from that address; an
    /// unaddressed request accepts any sender.
    pub fn reply_to(request: &Stanza) -> Self {
        let Some(id) = request.id() else {
            // Without an id nothing can be correlated
            return StanzaFilter::Any.not();
        };
        let mut filter = StanzaFilter::kind(StanzaKind::Iq)
            .and(StanzaFilter::id(id))
            .and(StanzaFilter::stanza_type("result").or(StanzaFilter::stanza_type("error")));
        if let Some(to) = request.to() {
            filter = filter.and(StanzaFilter::from(to));
        }
        filter
    }

    /// Conjunction
    pub fn and(self, other: StanzaFilter) -> Self {
        StanzaFilter::And(Box::new(self), Box::new(other))
    }

    /// Disjunction
    pub fn or(self, other: StanzaFilter) -> Self {
        StanzaFilter::Or(Box::new(self), Box::new(other))
    }

    /// Negation
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        StanzaFilter::Not(Box::new(self))
    }

    /// Evaluate against a stanza
    pub fn matches(&self, stanza: &Stanza) -> bool {
        match self {
            StanzaFilter::Any => true,
            StanzaFilter::Kind(kind) => stanza.kind() == *kind,
            StanzaFilter::Id(id) => stanza.id() == Some(id.as_str()),
            StanzaFilter::From(from) => stanza.from() == Some(from.as_str()),
            StanzaFilter::Type(t) => stanza.stanza_type() == Some(t.as_str()),
            StanzaFilter::Extension { name, namespace } => {
                stanza.extension(name, namespace).is_some()
            }
            StanzaFilter::And(a, b) => a.matches(stanza) && b.matches(stanza),
            StanzaFilter::Or(a, b) => a.matches(stanza) || b.matches(stanza),
            StanzaFilter::Not(inner) => !inner.matches(stanza),
            StanzaFilter::Custom(f) => f(stanza),
        }
    }
}

impl Default for StanzaFilter {
    fn default() -> Self {
        StanzaFilter::Any
    }
}

impl fmt::Debug for StanzaFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StanzaFilter::Any => write!(f, "any"),
            StanzaFilter::Kind(kind) => write!(f, "kind({:?})", kind),
            StanzaFilter::Id(id) => write!(f, "id({})", id),
            StanzaFilter::From(from) => write!(f, "from({})", from),
            StanzaFilter::Type(t) => write!(f, "type({})", t),
            StanzaFilter::Extension { name, namespace } => {
                write!(f, "extension({{{}}}{})", namespace, name)
            }
            StanzaFilter::And(a, b) => write!(f, "({:?} && {:?})", a, b),
            StanzaFilter::Or(a, b) => write!(f, "({:?} || {:?})", a, b),
            StanzaFilter::Not(inner) => write!(f, "!{:?}", inner),
            StanzaFilter::Custom(_) => write!(f, "custom"),
        }
    }
}
