//! Execution environment lifecycle for the runbox sandbox server.
//!
//! This crate owns everything below the client connection: the language table
//! that maps a language name to container images, the runtime contract used to
//! create and destroy sandboxes, and the [`EnvironmentHandle`] that ties one
//! running sandbox to the session that provisioned it.
//!
//! # Layout
//!
//! - **config**: language table loading and validation
//! - **runtime**: container runtime contract and its Docker implementation
//! - **environment**: provisioning, code upload and teardown of one sandbox
//! - **errors**: error types for each of the above

pub mod config;
pub mod environment;
pub mod errors;
pub mod runtime;

pub use config::{EnvironmentSpec, LanguageProfile, LanguageTable, SessionKind};
pub use environment::EnvironmentHandle;
pub use errors::{ConfigError, EnvironmentError, RuntimeError};
pub use runtime::{AttachedStream, ContainerRuntime, CreateRequest, DockerRuntime};
