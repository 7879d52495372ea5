//! Error types for pa-core

use thiserror::Error;

/// Main error type for pa-core
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pa-core
pub type Result<T> = std::result::Result<T, Error>;
