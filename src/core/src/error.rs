use thiserror::Error;

/// docker2aci error types
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Malformed image reference
    #[error("bad image reference {reference:?}: {message}")]
    BadReference { reference: String, message: String },

    /// Registry could not be reached or answered with an unexpected status
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    /// Registry rejected our credentials (or lack thereof)
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Image, tag or blob not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Registry served a manifest with a media type we don't accept
    #[error("unsupported manifest media type {media_type:?}")]
    BadManifestMediaType { media_type: String },

    /// Blob or manifest content did not match its expected digest
    #[error("digest mismatch: expected {expected}, got {computed}")]
    BadDigest { expected: String, computed: String },

    /// Layer blob is neither a tar nor a gzipped tar
    #[error("bad layer format: {0}")]
    BadLayerFormat(String),

    /// Layer contents violate conversion constraints
    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    /// A "docker save" tar holds more than one image and no selector was given
    #[error("several images found, choose one of: {}", .images.join(" "))]
    SeveralImages { images: Vec<String> },

    /// Malformed image configuration (os/arch tuple, port, user, ...)
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A produced ACI failed structural validation
    #[error("invalid ACI generated: {0}")]
    AciValidationFailed(String),
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::Serialization(err.to_string())
    }
}

/// Result type alias for docker2aci operations
pub type Result<T> = std::result::Result<T, ConvertError>;
