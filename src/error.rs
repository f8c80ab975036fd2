use std::sync::Arc;

/// Represents a result type for operations in the SDK that talk to the network or manage
/// background threads.
///
/// Local flag evaluation does not use this type. See [`EvaluationResult`](crate::EvaluationResult).
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing transport and lifecycle errors.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid host configuration.
    #[error("invalid host configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid personal API key.
    #[error("unauthorized, personal_api_key is likely invalid")]
    Unauthorized,

    /// The operation needs a personal API key, but none was configured.
    #[error("local evaluation is disabled, personal_api_key is not configured")]
    LocalEvaluationDisabled,

    /// The server reported that the feature flags quota for the project is exhausted.
    #[error("feature flags quota exceeded")]
    QuotaLimited,

    /// The server responded with a status the SDK does not handle.
    #[error("unexpected response status {status}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// The server response could not be parsed.
    #[error("malformed response (status {status}): {message}")]
    MalformedResponse {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
        /// Parser error message.
        message: String,
    },

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        // Query strings carry the project token.
        Error::Network(Arc::new(value.without_url()))
    }
}
