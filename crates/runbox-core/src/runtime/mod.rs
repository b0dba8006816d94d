//! Container runtime collaborator contract.
//!
//! The session core never talks to Docker directly. It goes through
//! [`ContainerRuntime`], which is shared as `Arc<dyn ContainerRuntime>` by all
//! concurrent sessions; every call carries its own container id, so
//! implementations must be safe for concurrent independent calls.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::pin::Pin;
use tokio::io::AsyncWrite;

use crate::errors::RuntimeError;

pub mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;

pub use docker::DockerRuntime;

/// Parameters for creating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub network_disabled: bool,
}

/// The combined interactive stream of an attached container.
///
/// Each item of `output` is forwarded to the client as one binary message;
/// client input is written to `input`.
pub struct AttachedStream {
    pub output: BoxStream<'static, Result<Bytes, RuntimeError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for AttachedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedStream").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create(&self, request: &CreateRequest) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Attach to stdin, stdout and stderr of a running container.
    async fn attach(&self, id: &str) -> Result<AttachedStream, RuntimeError>;

    /// Force-remove a container, stopping it if needed.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Extract a tar archive into the container filesystem at `dest`.
    async fn copy_archive_into(
        &self,
        id: &str,
        dest: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError>;

    /// Pull an image, returning once the pull has finished.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Check that the runtime is reachable.
    async fn ping(&self) -> Result<(), RuntimeError>;
}
