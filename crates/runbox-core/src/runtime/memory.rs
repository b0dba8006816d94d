//! In-memory [`ContainerRuntime`] for tests.
//!
//! Records every call, can be scripted to fail or stall on any operation, and
//! hands the container side of each attached stream to the test so it can
//! play the part of the program running inside.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{AttachedStream, ContainerRuntime, CreateRequest};
use crate::errors::RuntimeError;

/// Runtime operations that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Attach,
    Remove,
    Upload,
    Pull,
}

/// The container's side of an attached stream.
pub struct ContainerEnd {
    /// Reads what the session wrote to the container's stdin.
    pub stdin: DuplexStream,
    /// Sends output chunks to the session. Dropping it ends the stream.
    pub stdout: mpsc::UnboundedSender<Result<Bytes, RuntimeError>>,
}

#[derive(Default)]
struct State {
    created: Vec<(String, CreateRequest)>,
    started: Vec<String>,
    removed: Vec<String>,
    uploads: Vec<(String, String, Bytes)>,
    pulled: Vec<String>,
    ends: HashMap<String, ContainerEnd>,
}

#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
    failures: HashMap<Op, String>,
    delays: HashMap<Op, Duration>,
    next_id: AtomicUsize,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail with `message`.
    pub fn fail_on(mut self, op: Op, message: impl Into<String>) -> Self {
        self.failures.insert(op, message.into());
        self
    }

    /// Make `op` wait for `delay` before doing anything.
    pub fn delay_on(mut self, op: Op, delay: Duration) -> Self {
        self.delays.insert(op, delay);
        self
    }

    async fn enter(&self, op: Op) -> Result<(), RuntimeError> {
        if let Some(delay) = self.delays.get(&op) {
            tokio::time::sleep(*delay).await;
        }
        match self.failures.get(&op) {
            Some(message) => Err(RuntimeError::failed(message.clone())),
            None => Ok(()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn created(&self) -> Vec<CreateRequest> {
        self.with_state(|s| s.created.iter().map(|(_, r)| r.clone()).collect())
    }

    pub fn created_ids(&self) -> Vec<String> {
        self.with_state(|s| s.created.iter().map(|(id, _)| id.clone()).collect())
    }

    pub fn started(&self) -> Vec<String> {
        self.with_state(|s| s.started.clone())
    }

    pub fn removed(&self) -> Vec<String> {
        self.with_state(|s| s.removed.clone())
    }

    /// `(container id, destination, archive)` for every upload.
    pub fn uploads(&self) -> Vec<(String, String, Bytes)> {
        self.with_state(|s| s.uploads.clone())
    }

    pub fn pulled(&self) -> Vec<String> {
        self.with_state(|s| s.pulled.clone())
    }

    /// Take the container side of the stream attached to `id`.
    pub fn take_end(&self, id: &str) -> Option<ContainerEnd> {
        self.with_state(|s| s.ends.remove(id))
    }

    /// Wait until some container has been attached and take its end.
    pub async fn next_end(&self) -> ContainerEnd {
        loop {
            let end = self.with_state(|s| {
                let id = s.ends.keys().next().cloned()?;
                s.ends.remove(&id)
            });
            if let Some(end) = end {
                return end;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create(&self, request: &CreateRequest) -> Result<String, RuntimeError> {
        self.enter(Op::Create).await?;
        let id = format!("mem-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.with_state(|s| s.created.push((id.clone(), request.clone())));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.enter(Op::Start).await?;
        self.with_state(|s| s.started.push(id.to_string()));
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<AttachedStream, RuntimeError> {
        self.enter(Op::Attach).await?;
        let (session_side, container_side) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|s| {
            s.ends.insert(
                id.to_string(),
                ContainerEnd {
                    stdin: container_side,
                    stdout: tx,
                },
            )
        });

        let output = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();

        Ok(AttachedStream {
            output,
            input: Box::pin(session_side),
        })
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        // recorded before the scripted failure so tests can count attempts
        self.with_state(|s| s.removed.push(id.to_string()));
        self.enter(Op::Remove).await
    }

    async fn copy_archive_into(
        &self,
        id: &str,
        dest: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError> {
        self.enter(Op::Upload).await?;
        self.with_state(|s| s.uploads.push((id.to_string(), dest.to_string(), archive)));
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.enter(Op::Pull).await?;
        self.with_state(|s| s.pulled.push(image.to_string()));
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }
}
