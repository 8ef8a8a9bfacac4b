//! Error types for the SDK.
//!
//! Every fallible operation returns [`Result`] over [`SdkError`]. The error
//! kind taxonomy is stable across the public boundary; bridges map kinds to
//! their platform-native error domains by name.

use std::fmt;

/// Stable error taxonomy surfaced to SDK users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required pointer/reference argument was null or absent.
    InvalidInputNullPointer,
    /// A parameter value was outside its documented range.
    InvalidInputParameterValue,
    /// Audio data was empty or structurally invalid.
    InvalidInputAudioFormat,
    /// A model handle did not refer to a loaded model.
    InvalidInputModelHandle,
    /// SDK or component configuration was invalid.
    InvalidInputConfiguration,
    /// A required string argument was empty.
    InvalidInputEmptyString,
    /// The model file does not exist on disk.
    ModelFileNotFound,
    /// The model file exists but failed integrity verification.
    ModelFileCorrupted,
    /// The model id is not present in the registry.
    ModelNotFoundInRegistry,
    /// An inference operation was attempted without a loaded model.
    InferenceModelNotLoaded,
    /// Inference input was rejected by the engine.
    InferenceInvalidInput,
    /// Prompt plus requested tokens exceed the model's context window.
    InferenceContextWindowExceeded,
    /// No requested hardware accelerator could be configured.
    InferenceHardwareAccelerationFailure,
    /// Host memory was exhausted.
    ResourceOutOfMemory,
    /// The worker thread pool could not accept more work.
    ResourceThreadPoolExhausted,
    /// GPU memory was exhausted.
    ResourceGPUMemoryExhausted,
    /// Not enough free disk space for the operation.
    StorageInsufficientSpace,
    /// A filesystem read or write failed.
    StorageReadError,
    /// The network was unreachable.
    NetworkUnreachable,
    /// A connection or read timed out.
    NetworkConnectionTimeout,
    /// The server answered with a non-success HTTP status.
    NetworkHTTPError,
    /// Host name resolution failed.
    NetworkDNSFailure,
    /// TLS negotiation or certificate validation failed.
    NetworkSSLError,
    /// The operation was cancelled by the caller.
    OperationCancelled,
    /// Unclassified failure.
    Unknown,
}

impl ErrorKind {
    /// Stable name of the kind, as surfaced across the public boundary.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInputNullPointer => "InvalidInputNullPointer",
            Self::InvalidInputParameterValue => "InvalidInputParameterValue",
            Self::InvalidInputAudioFormat => "InvalidInputAudioFormat",
            Self::InvalidInputModelHandle => "InvalidInputModelHandle",
            Self::InvalidInputConfiguration => "InvalidInputConfiguration",
            Self::InvalidInputEmptyString => "InvalidInputEmptyString",
            Self::ModelFileNotFound => "ModelFileNotFound",
            Self::ModelFileCorrupted => "ModelFileCorrupted",
            Self::ModelNotFoundInRegistry => "ModelNotFoundInRegistry",
            Self::InferenceModelNotLoaded => "InferenceModelNotLoaded",
            Self::InferenceInvalidInput => "InferenceInvalidInput",
            Self::InferenceContextWindowExceeded => "InferenceContextWindowExceeded",
            Self::InferenceHardwareAccelerationFailure => {
                "InferenceHardwareAccelerationFailure"
            }
            Self::ResourceOutOfMemory => "ResourceOutOfMemory",
            Self::ResourceThreadPoolExhausted => "ResourceThreadPoolExhausted",
            Self::ResourceGPUMemoryExhausted => "ResourceGPUMemoryExhausted",
            Self::StorageInsufficientSpace => "StorageInsufficientSpace",
            Self::StorageReadError => "StorageReadError",
            Self::NetworkUnreachable => "NetworkUnreachable",
            Self::NetworkConnectionTimeout => "NetworkConnectionTimeout",
            Self::NetworkHTTPError => "NetworkHTTPError",
            Self::NetworkDNSFailure => "NetworkDNSFailure",
            Self::NetworkSSLError => "NetworkSSLError",
            Self::OperationCancelled => "OperationCancelled",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried by every fallible SDK operation.
///
/// `message` is a human-readable description, `details` identifies the
/// offending input (handle value, path, parameter name and value), and
/// `recovery_suggestion` tells the caller what to try next when there is a
/// sensible next step.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message} ({details})")]
pub struct SdkError {
    /// Stable error kind.
    pub kind: ErrorKind,
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Context identifying the offending input.
    pub details: String,
    /// Optional suggestion for recovering from the failure.
    pub recovery_suggestion: Option<String>,
}

impl SdkError {
    /// Create an error with a kind, message and details.
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: details.into(),
            recovery_suggestion: None,
        }
    }

    /// Attach a recovery suggestion.
    #[must_use]
    pub fn with_recovery(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestion = Some(suggestion.into());
        self
    }
}

impl From<std::io::Error> for SdkError {
    fn from(e: std::io::Error) -> Self {
        Self::new(
            ErrorKind::StorageReadError,
            "filesystem operation failed",
            e.to_string(),
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SdkError>;
