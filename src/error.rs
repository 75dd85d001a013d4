//! Error types for the match resolution daemon.
//!
//! This module defines custom error enums for each component of the daemon,
//! providing descriptive error messages with context information.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while sampling the target application.
///
/// `ProcessListUnavailable` and `EmptyProcessList` mean there is no data for
/// the current tick; the engine skips it and keeps its prior state.
#[derive(Error, Debug)]
pub enum SampleError {
    #[error("Process list unavailable: {0}")]
    ProcessListUnavailable(String),

    #[error("Process list was empty")]
    EmptyProcessList,

    #[error("CPU time unavailable for pid {pid}: {reason}")]
    CpuUnavailable { pid: u32, reason: String },
}

/// Errors related to display control operations.
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("display command '{0}' not found in PATH")]
    CommandNotFound(String),

    #[error("display command failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("display command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to execute command: {0}")]
    ExecutionFailed(#[from] std::io::Error),

    #[error("resolution change failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<DisplayError>,
    },
}

/// Errors produced when parsing a `WIDTHxHEIGHT` resolution string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionParseError {
    #[error("invalid resolution '{0}', expected WIDTHxHEIGHT")]
    Malformed(String),

    #[error("resolution dimensions must be positive, got {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },
}

/// Errors related to the control socket.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to bind socket at '{path}': {source}")]
    SocketBindFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid command received: {0}")]
    InvalidCommand(String),

    #[error("Failed to serialize response: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Engine unavailable: {0}")]
    Engine(#[from] EngineError),
}

/// Errors related to configuration management.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to write configuration: {0}")]
    WriteError(#[from] std::io::Error),
}

/// Errors returned by the engine handle.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("monitoring engine is not running")]
    Stopped,

    #[error("display error: {0}")]
    Display(#[from] DisplayError),
}

/// Errors related to logging initialization.
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Could not determine a local data directory for logs")]
    DataDirectoryNotFound,

    #[error("Failed to create log directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    AppenderCreationFailed(String),
}

/// Top-level daemon errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] LoggingError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}
