//! Environment handle: one provisioned, running sandbox and its attached stream.
//!
//! A handle only exists once its container is running and attached. It is
//! owned by exactly one session and must be given back through
//! [`EnvironmentHandle::close`]. Dropping an unclosed handle still removes the
//! container, in the background, so a cancelled session does not leak it.

use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{timeout_at, Instant};

use crate::config::EnvironmentSpec;
use crate::errors::{EnvironmentError, RuntimeError};
use crate::runtime::{AttachedStream, ContainerRuntime, CreateRequest};

/// Name of the single archive entry holding uploaded source code.
pub const CODE_ENTRY_NAME: &str = "code";
/// Uploaded code is read-only inside the sandbox.
pub const CODE_ENTRY_MODE: u32 = 0o444;
/// Directory the code archive is extracted into.
pub const CODE_DESTINATION: &str = "/";
/// Longest a session waits for the attached stream to shut down on close.
pub const STREAM_SHUTDOWN_LIMIT: Duration = Duration::from_secs(5);

async fn before<T, F>(deadline: Instant, limit: Duration, fut: F) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    timeout_at(deadline, fut)
        .await
        .map_err(|_| RuntimeError::Timeout(limit))?
}

async fn remove_best_effort(runtime: &dyn ContainerRuntime, id: &str, limit: Duration) {
    match before(Instant::now() + limit, limit, runtime.remove(id)).await {
        Ok(()) => log::debug!("Removed container {}", id),
        Err(e) => log::error!("Failed to remove container {}: {}", id, e),
    }
}

pub struct EnvironmentHandle {
    id: String,
    stream: Option<AttachedStream>,
    runtime: Arc<dyn ContainerRuntime>,
    cleanup_timeout: Duration,
    closed: bool,
}

impl EnvironmentHandle {
    /// Create, start and attach to a sandbox for `spec`.
    ///
    /// The sandbox has networking disabled, stdin open and a TTY. All three
    /// runtime calls share one deadline, `limit` from now. If anything fails
    /// after the container was created it is force-removed (with a fresh
    /// deadline of the same length) before the error is returned.
    pub async fn provision(
        runtime: Arc<dyn ContainerRuntime>,
        spec: &EnvironmentSpec,
        name: Option<String>,
        limit: Duration,
    ) -> Result<Self, EnvironmentError> {
        let deadline = Instant::now() + limit;
        let request = CreateRequest {
            name,
            image: spec.image.clone(),
            command: spec.command.clone(),
            tty: true,
            open_stdin: true,
            network_disabled: true,
        };

        let id = before(deadline, limit, runtime.create(&request))
            .await
            .map_err(EnvironmentError::Provision)?;

        let attached = before(deadline, limit, async {
            runtime.start(&id).await?;
            runtime.attach(&id).await
        })
        .await;

        match attached {
            Ok(stream) => {
                log::debug!("Container {} running and attached", id);
                Ok(Self {
                    id,
                    stream: Some(stream),
                    runtime,
                    cleanup_timeout: limit,
                    closed: false,
                })
            }
            Err(e) => {
                log::warn!("Container {} failed to start: {}", id, e);
                remove_best_effort(runtime.as_ref(), &id, limit).await;
                Err(EnvironmentError::Provision(e))
            }
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The attached stream, until [`close`](Self::close) takes it down.
    pub fn stream_mut(&mut self) -> Option<&mut AttachedStream> {
        self.stream.as_mut()
    }

    /// Pack `payload` as the code archive and extract it at `dest`.
    pub async fn push_file(
        &mut self,
        dest: &str,
        payload: &[u8],
        limit: Duration,
    ) -> Result<(), EnvironmentError> {
        let archive = pack_code_archive(payload).map_err(EnvironmentError::Archive)?;
        log::debug!(
            "Uploading {} byte archive to {}:{}",
            archive.len(),
            self.id,
            dest
        );
        before(
            Instant::now() + limit,
            limit,
            self.runtime.copy_archive_into(&self.id, dest, archive),
        )
        .await
        .map_err(EnvironmentError::Upload)
    }

    /// Close the stream, then force-remove the container.
    ///
    /// Shutting the stream down is capped at [`STREAM_SHUTDOWN_LIMIT`] so a
    /// stalled stream cannot eat into the removal. Removal then gets the full
    /// `limit` and is attempted even when closing the stream fails. If both
    /// fail the stream error is returned; a removal failure is always logged.
    ///
    /// Until removal has been attempted the `Drop` fallback stays armed, so a
    /// cancelled `close` still removes the container in the background.
    pub async fn close(mut self, limit: Duration) -> Result<(), EnvironmentError> {
        let close_result = match self.stream.take() {
            Some(mut stream) => {
                let shutdown_limit = limit.min(STREAM_SHUTDOWN_LIMIT);
                let result = before(Instant::now() + shutdown_limit, shutdown_limit, async {
                    stream.input.shutdown().await.map_err(RuntimeError::from)
                })
                .await;
                if let Err(e) = &result {
                    log::warn!("Failed to close stream of container {}: {}", self.id, e);
                }
                drop(stream);
                result
            }
            None => Ok(()),
        };

        let remove_result = before(Instant::now() + limit, limit, self.runtime.remove(&self.id)).await;
        self.closed = true;
        if let Err(e) = &remove_result {
            log::error!("Failed to remove container {}: {}", self.id, e);
        }

        close_result
            .and(remove_result)
            .map_err(EnvironmentError::Close)
    }
}

impl Drop for EnvironmentHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.stream.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!(
                    "Container {} dropped without close, removing in background",
                    self.id
                );
                let runtime = Arc::clone(&self.runtime);
                let id = std::mem::take(&mut self.id);
                let limit = self.cleanup_timeout;
                handle.spawn(async move {
                    remove_best_effort(runtime.as_ref(), &id, limit).await;
                });
            }
            Err(_) => log::error!(
                "Container {} dropped outside of a runtime and was not removed",
                self.id
            ),
        }
    }
}

impl std::fmt::Debug for EnvironmentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentHandle")
            .field("id", &self.id)
            .field("attached", &self.stream.is_some())
            .finish()
    }
}

/// Build a tar archive holding `payload` as a single read-only file named
/// [`CODE_ENTRY_NAME`].
pub fn pack_code_archive(payload: &[u8]) -> std::io::Result<Bytes> {
    let mut header = tar::Header::new_gnu();
    header.set_path(CODE_ENTRY_NAME)?;
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(CODE_ENTRY_MODE);
    header.set_size(payload.len() as u64);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, payload)?;
    Ok(Bytes::from(builder.into_inner()?))
}
