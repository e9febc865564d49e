//! ## Channel broker wire vocabulary
//!
//! Everything a client and the broker have to agree on lives here: the
//! event types and envelopes exchanged over the transport, the agent
//! metadata projected into rosters, the recipient filter expression
//! language, and the channel identity/secret derivation that both sides
//! compute independently.
//!
//! The broker treats event `content` as an opaque string end to end; this
//! crate therefore never parses payloads, only the routing fields around
//! them.

pub mod crypto;
pub mod filter;
pub mod message;

pub use self::{
    filter::Filter,
    message::{
        AgentInfo, ApiKeyScope, Envelope, EventMessage, EventType, IceServer, PollSource,
        ReceiveConfig, SYSTEM_ROLE_PREFIX,
    },
};

#[derive(Debug)]
pub enum Error {
    /// The expression ended where a key, value or operator was expected.
    UnexpectedEnd,
    /// A token that has no meaning at its position, e.g. `role = = client`.
    UnexpectedToken(String),
    /// Input left over after a complete expression, e.g. `a=1)`.
    TrailingInput(String),
    /// A bare `&` or `|`; the grammar only knows the doubled forms.
    DanglingOperator(char),
    /// An unterminated quoted value.
    UnterminatedQuote,
    /// A wildcard pattern that could not be compiled.
    BadPattern(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<regex::Error> for Error {
    fn from(value: regex::Error) -> Self {
        Self::BadPattern(value.to_string())
    }
}
