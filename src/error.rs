use thiserror::Error;

/// Why metadata could not be read out of an archive. Always recoverable:
/// the scanner substitutes fallback metadata.
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Info.plist not found")]
    InfoPlistNotFound,

    #[error("Info.plist exceeds {0} bytes")]
    InfoPlistTooLarge(u64),

    #[error("Info.plist is not a dictionary")]
    NotADictionary,

    #[error("required metadata missing")]
    MissingMetadata,
}

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Provisioning failed: {0}")]
    Provision(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("External tool failed: {0}")]
    ToolFailed(String),
}

pub type Result<T> = std::result::Result<T, OtaError>;
