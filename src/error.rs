//! Unified error types for Skiff

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for Skiff operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Jail errors
    #[error("Jail '{0}' is already running")]
    JailAlreadyRunning(String),

    #[error("Jail root already exists: {0}")]
    JailPathExists(PathBuf),

    #[error("Jail '{0}' is not running")]
    JailNotRunning(String),

    #[error("Jail operation failed: {0}")]
    JailOperation(String),

    // FFI errors
    #[error("jail_get syscall failed: {0}")]
    JailGet(String),

    #[error("jail_set syscall failed: {0}")]
    JailSet(String),

    #[error("jail_remove syscall failed")]
    JailRemoveFailed,

    #[error("Failed to create C string: {0}")]
    CString(#[from] std::ffi::NulError),

    // ZFS errors
    #[error("ZFS operation failed: {0}")]
    Zfs(String),

    // Release errors
    #[error("Failed to download: {0}")]
    DownloadFailed(String),

    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("Release '{0}' not found")]
    ReleaseNotFound(String),

    #[error("Release '{0}' already exists")]
    ReleaseAlreadyExists(String),

    #[error("Failed to extract archive: {0}")]
    ExtractionFailed(String),

    #[error("Unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Interface '{0}' not found")]
    InterfaceNotFound(String),

    // Jail execution timeout
    #[error("Jail command timeout after {0:?}")]
    JailTimeout(Duration),

    // Web console errors
    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("Unable to generate SSL certificate and key, check permissions at path: {0}")]
    CertificateBootstrap(PathBuf),
}

/// Result type alias for Skiff operations
pub type Result<T> = std::result::Result<T, Error>;
