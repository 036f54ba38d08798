/// Protocol-level session failures.
/// These are handled inside the transport binder and turned into HTTP
/// responses; they never propagate as process faults.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Send-class request targeting an id the registry does not know.
    #[error("session not found")]
    NotFound,
    /// A receiver is already attached; the first one is left untouched.
    #[error("another connection is still open")]
    AlreadyAttached,
    /// The session reached its terminal state.
    #[error("session closed")]
    Closed,
    /// Unparsable or empty inbound body. The message is the exact body the
    /// client sees on the 500 response.
    #[error("{0}")]
    MalformedPayload(&'static str),
}

impl SessionError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyAttached => "already_attached",
            Self::Closed => "closed",
            Self::MalformedPayload(_) => "malformed_payload",
        }
    }
}
