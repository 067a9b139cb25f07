use thiserror::Error;

/// Errors produced by the runtime.
///
/// Every variant maps onto one of the five [`ErrorKind`] categories; callers
/// that only care about the category should match on [`EchoError::kind`].
#[derive(Error, Debug)]
pub enum EchoError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Context capacity exceeded: {0}")]
    CapacityError(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Failed to load model: {0}")]
    ModelLoadError(String),

    #[error("Tokenization failed: {0}")]
    TokenizationError(String),

    #[error("Metadata format error: {0}")]
    FormatError(String),

    #[error("Resource error: {0}")]
    ResourceError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coarse error taxonomy shared by all public operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No model loaded, unknown or duplicate session id, invalid settings.
    Configuration,
    /// The rolling context would overflow.
    Capacity,
    /// Tokenize, decode, sample or template failure reported by the backend.
    Backend,
    /// Corrupt or unreadable metadata header.
    Format,
    /// Missing image file, absent encoder, unreadable input.
    Resource,
}

impl EchoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EchoError::ConfigurationError(_) => ErrorKind::Configuration,
            EchoError::CapacityError(_) => ErrorKind::Capacity,
            EchoError::BackendError(_)
            | EchoError::ModelLoadError(_)
            | EchoError::TokenizationError(_) => ErrorKind::Backend,
            EchoError::FormatError(_) => ErrorKind::Format,
            EchoError::ResourceError(_) | EchoError::ImageError(_) | EchoError::IoError(_) => {
                ErrorKind::Resource
            }
        }
    }

    pub(crate) fn no_model() -> Self {
        EchoError::ConfigurationError("Model not loaded".to_string())
    }

    pub(crate) fn unknown_session(id: impl std::fmt::Display) -> Self {
        EchoError::ConfigurationError(format!("Unknown session id: {}", id))
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        EchoError::BackendError(format!("{} lock poisoned", what))
    }
}

impl From<image::ImageError> for EchoError {
    fn from(err: image::ImageError) -> Self {
        EchoError::ImageError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EchoError>;
