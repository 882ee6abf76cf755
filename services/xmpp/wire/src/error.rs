//! Stream codec error types.

use thiserror::Error;

/// Stream codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Underlying XML syntax error
    #[error("xml: {0}")]
    Xml(String),

    /// Buffered element exceeds the configured limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Text or attribute is not valid UTF-8 or has a bad escape
    #[error("bad text: {0}")]
    Text(String),

    /// Element uses a namespace prefix that was never declared
    #[error("unbound prefix {0}")]
    UnboundPrefix(String),

    /// Base64 payload could not be decoded
    #[error("bad base64 payload")]
    Base64,

    /// Required attribute is absent or unparsable
    #[error("bad attribute {attr} on <{element}>")]
    Attribute {
        /// Element name
        element: String,
        /// Attribute name
        attr: String,
    },

    /// Element is not what the caller expected
    #[error("unexpected element <{name} xmlns='{namespace}'>")]
    Unexpected {
        /// Local name
        name: String,
        /// Namespace URI
        namespace: String,
    },

    /// Non-whitespace character data between top-level elements
    #[error("stray text at stream level")]
    StrayText,
}
