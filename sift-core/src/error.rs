use thiserror::Error;

/// Engine error taxonomy.
///
/// Fatal-at-the-request kinds (syntax, bad pattern variable, capacity,
/// disabled) abort the operation that raised them. Non-fatal kinds
/// (not-found, expired) are handled or surfaced per call site; expiration
/// observed on a read also triggers cleanup of the expired entry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("bad pattern variable: {0}")]
    BadPatternVariable(String),

    #[error("unknown pattern: {0}")]
    UnknownPattern(String),

    #[error("location '{0}' is at capacity")]
    CapacityExceeded(String),

    #[error("location '{0}' is disabled")]
    Disabled(String),

    #[error("duplicate id '{0}' across ancestor locations")]
    DuplicateId(String),

    #[error("ancestor loop through location '{0}'")]
    AncestorLoop(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("too many pending requests")]
    TooMany,

    #[error("script error: {0}")]
    Script(String),

    #[error("script timed out after {0}ms")]
    ScriptTimeout(u64),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unsupported endpoint '{0}'")]
    UnsupportedEndpoint(String),

    #[error("http error: {0}")]
    Http(String),
}

impl Error {
    /// Whether the observing caller can treat the condition as recoverable
    /// and carry on (missing or expired entities, backpressure rejections).
    pub fn is_nonfatal(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::Expired(_) | Error::Throttled(_) | Error::TooMany
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
