//! XML stream framing, stanza model and extension registry for xmpp.
//!
//! This crate turns the bytes of a client-to-server XMPP stream into a sequence of
//! typed top-level items and back. It performs no I/O; the session crate feeds it
//! whatever the transport delivers.
//!
//! ## Features
//!
//! - **Incremental decoding**: input may be split at any byte, partial elements stay buffered
//! - **Namespace aware**: stanzas inherit the stream's default namespace
//! - **Two framings**: classic `<stream:stream>` and RFC 7395 WebSocket `<open/>`/`<close/>`
//! - **Opaque extensions**: unknown children survive decode/encode untouched
//! - **Pluggable decoders**: typed payloads through an explicit [`ExtensionRegistry`]
//!
//! ## Stream Layout
//!
//! ```text
//! +------------------------------+----------------------------------+
//! | <stream:stream ...>          | Frame::StreamOpen(StreamHeader)  |
//! +------------------------------+----------------------------------+
//! | <stream:features/>, <a/> ... | Frame::Nonza(Nonza)              |
//! +------------------------------+----------------------------------+
//! | <message/> <presence/> <iq/> | Frame::Stanza(Stanza)            |
//! +------------------------------+----------------------------------+
//! | whitespace                   | keepalive, skipped               |
//! +------------------------------+----------------------------------+
//! | </stream:stream>             | Frame::StreamClose               |
//! +------------------------------+----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod element;
pub mod error;
pub mod features;
pub mod frame;
pub mod nonza;
pub mod ns;
pub mod registry;
pub mod stanza;

// Re-export main types
pub use codec::{Framing, StreamDecoder, StreamEncoder, DEFAULT_MAX_ELEMENT_SIZE};
pub use element::{Element, Node};
pub use error::WireError;
pub use features::StreamFeatures;
pub use frame::{Frame, StreamHeader};
pub use nonza::{decode_payload, encode_payload, ErrorCondition, Nonza, SmEnabled};
pub use registry::{Extension, ExtensionDecoder, ExtensionPayload, ExtensionRegistry};
pub use stanza::{next_stanza_id, Stanza, StanzaBuilder, StanzaKind};
