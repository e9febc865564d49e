use thiserror::Error;

/// Failures surfaced to callers of the service operations.
///
/// The `Display` strings are the wire-visible status messages; clients key
/// their reconnect logic off `Agent session not found`, so that text is
/// part of the contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Bad developer api key or channel password hash mismatch.
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Channel not found")]
    ChannelNotFound,

    #[error("Agent session not found")]
    SessionNotFound,

    /// The agent name is already live in the channel.
    #[error("Agent name conflict")]
    AgentNameConflict,

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Backend unavailable; the call may be retried with the same
    /// arguments because offsets only commit on a successful append.
    #[error("Transient backend failure: {0}")]
    Transient(String),

    #[error("Quota exceeded")]
    QuotaExceeded,
}

impl ServiceError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }
}
