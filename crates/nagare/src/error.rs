use thiserror::Error;

use crate::{argument::ArgumentError, validate::ValidationError};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Builds the error a failed request is reported as.
///
/// Requests default to [`NagareError::plugin`]; the HLS pipeline reports
/// with [`NagareError::stream`].
pub type ErrorConstructor = fn(String, BoxError) -> NagareError;

#[derive(Error, Debug)]
pub enum NagareError {
    #[error("{message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("HTTP error {status} for url ({url})")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("Incomplete read from {url}: expected {expected} bytes, got {actual}")]
    IncompleteRead {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid playlist: {0}")]
    Protocol(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("No playable streams found on this URL: {0}")]
    NoStreams(String),

    #[error("No plugin can handle URL: {0}")]
    NoPlugin(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Read timeout exceeded")]
    ReadTimeout,

    #[error("Buffer closed")]
    BufferClosed,

    #[error("{message}")]
    Plugin {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{message}")]
    Stream {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid AES-128 key: {0:?}")]
    InvalidAes128Key(Vec<u8>),

    #[error("Unable to decrypt cipher {0}")]
    UnsupportedCipher(String),

    #[error("Pkcs7 unpad error")]
    UnpadError,

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl NagareError {
    pub fn plugin(message: String, source: BoxError) -> Self {
        Self::Plugin {
            message,
            source: Some(source),
        }
    }

    pub fn stream(message: String, source: BoxError) -> Self {
        Self::Stream {
            message,
            source: Some(source),
        }
    }

    pub fn transport(error: reqwest::Error) -> Self {
        Self::Transport {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

pub type NagareResult<T> = Result<T, NagareError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_keeps_cause() {
        let cause = NagareError::Protocol("missing header".to_string());
        let err = NagareError::stream("Unable to open URL: x (y)".to_string(), Box::new(cause));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Invalid playlist: missing header"));
    }
}
