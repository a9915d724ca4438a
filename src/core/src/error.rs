use thiserror::Error;

/// A3S diff error types
#[derive(Error, Debug)]
pub enum DiffError {
    /// An apply option failed or produced an invalid configuration
    #[error("Invalid apply configuration: {0}")]
    InvalidConfig(String),

    /// Engine configuration file error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The content store could not produce a reader
    #[error("Content retrieval error: {digest} - {message}")]
    ContentRetrieval { digest: String, message: String },

    /// No registered processor accepts the media type
    #[error("No decoder for media type {0}")]
    NoDecoder(String),

    /// The processor chain cannot reach the canonical layer media type
    #[error("Unresolvable encoding chain for {media_type}: {reason}")]
    UnresolvableChain { media_type: String, reason: String },

    /// A decoder rejected the encoded stream while being constructed
    #[error("Invalid encoded stream ({media_type}): {source}")]
    InvalidStream {
        media_type: String,
        #[source]
        source: std::io::Error,
    },

    /// A stream processor stage failed outside of decoding
    #[error("Stream processor error: {processor} - {message}")]
    ProcessorError { processor: String, message: String },

    /// Mount acquisition or release failed
    #[error("Mount error: {0}")]
    MountError(String),

    /// The extraction algorithm rejected the archive
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Trailing canonical data could not be drained
    #[error("Incomplete content stream: {0}")]
    IncompleteStream(String),

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Malformed digest string
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Content did not hash to the expected digest
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Registry token exchange error
    #[error("Registry auth error: {0}")]
    AuthError(String),

    /// Token endpoint answered with a status outside 2xx/3xx
    #[error("Unexpected status: {status}")]
    UnexpectedStatus {
        status: String,
        status_code: u16,
        body: Vec<u8>,
    },

    /// Token endpoint answered successfully without a token
    #[error("authorization server did not include a token in the response")]
    NoToken,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for DiffError {
    fn from(err: serde_json::Error) -> Self {
        DiffError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for DiffError {
    fn from(err: serde_yaml::Error) -> Self {
        DiffError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S diff operations
pub type Result<T> = std::result::Result<T, DiffError>;
