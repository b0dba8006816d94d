//! Error types for environment provisioning and configuration loading
//!
//! Errors are grouped by the phase of a session that produced them. Runtime
//! failures keep the collaborator's own message intact, since that text is what
//! ends up in the `err` field of a client-facing status frame.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the container runtime collaborator.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

impl RuntimeError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Failures of the environment handle lifecycle.
#[derive(Error, Debug)]
pub enum EnvironmentError {
    #[error(transparent)]
    Provision(RuntimeError),
    #[error(transparent)]
    Upload(RuntimeError),
    #[error(transparent)]
    Close(RuntimeError),
    #[error("failed to pack code archive: {0}")]
    Archive(std::io::Error),
}

/// Failures while loading the language table.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse language table: {0}")]
    Parse(String),
    #[error("Invalid language table: {0}")]
    Validation(String),
}
