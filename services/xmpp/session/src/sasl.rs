//! SASL adapter contract and built-in mechanisms.
//!
//! The negotiator never looks inside a mechanism. It asks the adapter which
//! mechanisms it supports, picks the first one the server offers, and then shuttles
//! challenges and responses between the server and the [`SaslExchange`].

use std::fmt;
use thiserror::Error;

/// Result of evaluating one server challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslOutcome {
    /// Send this response
    Response(Vec<u8>),
    /// Client side considers the exchange complete
    Success,
    /// Client side aborts the exchange
    Failure(String),
}

/// Errors raised by an adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaslError {
    /// Adapter cannot run the requested mechanism
    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),

    /// Mechanism-level failure
    #[error("mechanism failure: {0}")]
    Mechanism(String),
}

/// One running authentication exchange
pub trait SaslExchange: Send {
    /// Answer a server challenge
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> SaslOutcome;

    /// Check additional data sent with `<success/>`
    fn verify_success(&mut self, _additional: Option<&[u8]>) -> SaslOutcome {
        SaslOutcome::Success
    }
}

/// Supplies mechanisms and starts exchanges
pub trait SaslAdapter: Send + Sync + fmt::Debug {
    /// Supported mechanisms in order of preference
    fn mechanisms(&self) -> Vec<String>;

    /// Start `mechanism`; returns the exchange and its initial response, if any
    fn select_and_begin(
        &self,
        mechanism: &str,
        authzid: Option<&str>,
    ) -> Result<(Box<dyn SaslExchange>, Option<Vec<u8>>), SaslError>;
}

/// First adapter mechanism the server also offers
pub fn select_mechanism(adapter: &dyn SaslAdapter, offered: &[String]) -> Option<String> {
    adapter
        .mechanisms()
        .into_iter()
        .find(|m| offered.iter().any(|o| o.eq_ignore_ascii_case(m)))
}

/// Exchange that expects no challenges
struct SingleStep;

impl SaslExchange for SingleStep {
    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> SaslOutcome {
        SaslOutcome::Failure("unexpected challenge".to_string())
    }
}

/// PLAIN (RFC 4616) with a username and password
#[derive(Clone)]
pub struct PlainCredentials {
    username: String,
    password: String,
}

impl PlainCredentials {
    /// Credentials for the local part of the account
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Username
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl SaslAdapter for PlainCredentials {
    fn mechanisms(&self) -> Vec<String> {
        vec!["PLAIN".to_string()]
    }

    fn select_and_begin(
        &self,
        mechanism: &str,
        authzid: Option<&str>,
    ) -> Result<(Box<dyn SaslExchange>, Option<Vec<u8>>), SaslError> {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Err(SaslError::UnsupportedMechanism(mechanism.to_string()));
        }
        // message = [authzid] UTF8NUL authcid UTF8NUL passwd
        let mut initial = Vec::new();
        initial.extend_from_slice(authzid.unwrap_or("").as_bytes());
        initial.push(0);
        initial.extend_from_slice(self.username.as_bytes());
        initial.push(0);
        initial.extend_from_slice(self.password.as_bytes());
        Ok((Box::new(SingleStep), Some(initial)))
    }
}

/// ANONYMOUS (RFC 4505)
#[derive(Debug, Clone, Default)]
pub struct Anonymous {
    trace: Option<String>,
}

impl Anonymous {
    /// Anonymous login with an optional trace string
    pub fn new(trace: Option<String>) -> Self {
        Self { trace }
    }
}

impl SaslAdapter for Anonymous {
    fn mechanisms(&self) -> Vec<String> {
        vec!["ANONYMOUS".to_string()]
    }

    fn select_and_begin(
        &self,
        mechanism: &str,
        _authzid: Option<&str>,
    ) -> Result<(Box<dyn SaslExchange>, Option<Vec<u8>>), SaslError> {
        if !mechanism.eq_ignore_ascii_case("ANONYMOUS") {
            return Err(SaslError::UnsupportedMechanism(mechanism.to_string()));
        }
        let initial = self.trace.clone().unwrap_or_default().into_bytes();
        Ok((Box::new(SingleStep), Some(initial)))
    }
}
