use thiserror::Error;

/// Failures the router handles locally. None of these end the process; at
/// most a single connection is closed.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("username '{name}' is already taken")]
    NameConflict { name: String },

    #[error("user '{name}' is not available")]
    RecipientUnavailable { name: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("connection is closed")]
    TransportClosed,
}
