use thiserror::Error;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Unsupported image version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Region '{0}' not found")]
    RegionNotFound(String),

    #[error("Entity {0} not found")]
    EntityNotFound(String),

    #[error("Host error: {0}")]
    HostError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, TetherError>;

impl<T> From<std::sync::PoisonError<T>> for TetherError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
