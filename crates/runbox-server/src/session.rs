//! Session state machine: one client connection from upgrade to teardown.
//!
//! A session walks `Starting -> Provisioning -> (Ready -> Uploading ->)
//! Running -> Closing -> Closed`, reporting each client-visible step as a JSON
//! status frame. Once a sandbox has been provisioned, every path out of the
//! session goes through `Closing`, which removes the sandbox exactly once.

use axum::extract::ws::{close_code, CloseFrame, Message};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use runbox_core::environment::CODE_DESTINATION;
use runbox_core::{ContainerRuntime, EnvironmentHandle, EnvironmentSpec, SessionKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bridge::{bridge, frame_kind, ClientSocket};

/// Lifecycle status reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Ready,
    Uploading,
    Running,
    Error,
}

/// A status frame, `{"status": "...", "err": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: SessionStatus,
    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Error,
            error: Some(message.into()),
        }
    }

    fn to_message(&self) -> Message {
        Message::Text(serde_json::to_string(self).unwrap_or_default().into())
    }
}

/// Deadlines governing a session's bounded steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Create, start and attach together.
    pub provision: Duration,
    /// Pushing the uploaded code into the sandbox.
    pub upload: Duration,
    /// Closing the stream and removing the sandbox.
    pub cleanup: Duration,
    /// Waiting for the client to hang up after a provisioning failure.
    pub drain: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            provision: Duration::from_secs(60),
            upload: Duration::from_secs(60),
            cleanup: Duration::from_secs(60),
            drain: Duration::from_secs(10),
        }
    }
}

/// Everything a session needs that is shared with other sessions.
#[derive(Clone)]
pub struct SessionContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub timeouts: SessionTimeouts,
    /// Cancelled when the server shuts down. Sessions past provisioning stop
    /// what they are doing and go straight to cleanup.
    pub shutdown: CancellationToken,
}

impl SessionContext {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeouts: SessionTimeouts) -> Self {
        Self {
            runtime,
            timeouts,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Owns the running sessions so shutdown can interrupt them and wait for
/// their cleanup.
#[derive(Clone, Default)]
pub struct SessionSupervisor {
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a session as a tracked task that is interrupted on shutdown.
    pub fn spawn<C>(
        &self,
        ctx: SessionContext,
        kind: SessionKind,
        spec: EnvironmentSpec,
        mut conn: C,
    ) -> JoinHandle<SessionOutcome>
    where
        C: ClientSocket + 'static,
    {
        let ctx = ctx.with_shutdown(self.shutdown.clone());
        self.tracker
            .spawn(async move { run_session(&ctx, kind, &spec, &mut conn).await })
    }

    /// Number of sessions still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Interrupt every session and wait up to `limit` for them to clean up.
    /// Returns false if some were still running when the limit passed.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();
        tokio::time::timeout(limit, self.tracker.wait()).await.is_ok()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The connection failed before anything was provisioned.
    Disconnected,
    ProvisionFailed(String),
    UploadFailed(String),
    /// The connection failed after provisioning, before or instead of running.
    Aborted,
    /// The bridge ran and one side ended it.
    Completed,
    /// The server shut down while the session was live.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Provisioning,
    Ready,
    Uploading,
    Running,
    Closing,
    Closed,
}

struct Session<'a, C> {
    id: String,
    kind: SessionKind,
    ctx: &'a SessionContext,
    conn: &'a mut C,
}

impl<'a, C: ClientSocket> Session<'a, C> {
    fn enter(&self, phase: Phase) {
        log::debug!("Session {} ({}): {:?}", self.id, self.kind, phase);
    }

    async fn send_status(&mut self, update: StatusUpdate) -> Result<(), axum::Error> {
        self.conn.send(update.to_message()).await
    }

    async fn run(mut self, spec: &EnvironmentSpec) -> SessionOutcome {
        self.enter(Phase::Starting);
        if let Err(e) = self.send_status(StatusUpdate::new(SessionStatus::Starting)).await {
            log::debug!("Session {}: client gone before start: {}", self.id, e);
            return SessionOutcome::Disconnected;
        }

        self.enter(Phase::Provisioning);
        let provisioned = EnvironmentHandle::provision(
            Arc::clone(&self.ctx.runtime),
            spec,
            Some(format!("runbox-{}", self.id)),
            self.ctx.timeouts.provision,
        )
        .await;

        let mut handle = match provisioned {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                log::warn!(
                    "Session {}: failed to provision {}: {}",
                    self.id,
                    spec.image,
                    message
                );
                self.fail_before_provisioned(&message).await;
                return SessionOutcome::ProvisionFailed(message);
            }
        };
        log::info!(
            "Session {}: container {} running ({})",
            self.id,
            handle.id(),
            spec.image
        );

        let shutdown = self.ctx.shutdown.clone();
        let id = self.id.clone();
        let outcome = tokio::select! {
            outcome = self.drive(&mut handle) => outcome,
            _ = shutdown.cancelled() => {
                log::info!("Session {}: interrupted by server shutdown", id);
                SessionOutcome::Interrupted
            }
        };

        self.enter(Phase::Closing);
        match handle.close(self.ctx.timeouts.cleanup).await {
            Ok(()) => log::info!("Session {}: container removed", self.id),
            Err(e) => log::error!("Session {}: failed to stop container: {}", self.id, e),
        }

        match outcome {
            SessionOutcome::Aborted => {}
            SessionOutcome::Interrupted => self.close_connection(close_code::AWAY).await,
            _ => self.close_connection(close_code::NORMAL).await,
        }
        self.enter(Phase::Closed);
        outcome
    }

    /// Ready, upload and running steps. Returns instead of skipping cleanup.
    async fn drive(&mut self, handle: &mut EnvironmentHandle) -> SessionOutcome {
        if self.kind == SessionKind::Run {
            self.enter(Phase::Ready);
            if self.send_status(StatusUpdate::new(SessionStatus::Ready)).await.is_err() {
                return SessionOutcome::Aborted;
            }

            let Some(code) = self.receive_code().await else {
                return SessionOutcome::Aborted;
            };

            self.enter(Phase::Uploading);
            if self.send_status(StatusUpdate::new(SessionStatus::Uploading)).await.is_err() {
                return SessionOutcome::Aborted;
            }
            log::info!("Session {}: uploading {} bytes of code", self.id, code.len());
            if let Err(e) = handle
                .push_file(CODE_DESTINATION, &code, self.ctx.timeouts.upload)
                .await
            {
                let message = e.to_string();
                log::warn!("Session {}: upload failed: {}", self.id, message);
                if self.send_status(StatusUpdate::error(&message)).await.is_err() {
                    return SessionOutcome::Aborted;
                }
                return SessionOutcome::UploadFailed(message);
            }
        }

        self.enter(Phase::Running);
        if self.send_status(StatusUpdate::new(SessionStatus::Running)).await.is_err() {
            return SessionOutcome::Aborted;
        }

        let Some(stream) = handle.stream_mut() else {
            return SessionOutcome::Aborted;
        };
        bridge(&self.id, &mut *self.conn, stream).await;
        log::info!("Session {}: bridge ended", self.id);
        SessionOutcome::Completed
    }

    /// Read the single data message holding the program source.
    ///
    /// Binary and text frames are both accepted as source. Ping and pong
    /// frames are keepalives, not code: they are logged and skipped. Returns
    /// `None` if the client closes or fails first.
    async fn receive_code(&mut self) -> Option<Bytes> {
        loop {
            match self.conn.next().await {
                Some(Ok(Message::Binary(data))) => return Some(data),
                Some(Ok(Message::Text(text))) => {
                    return Some(Bytes::copy_from_slice(text.as_str().as_bytes()))
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    log::debug!("Session {}: client left before sending code", self.id);
                    return None;
                }
                Some(Ok(other)) => {
                    log::warn!(
                        "Session {}: ignoring {} frame while waiting for code",
                        self.id,
                        frame_kind(&other)
                    );
                }
            }
        }
    }

    /// Report a provisioning failure, close, and give the client a bounded
    /// window to hang up.
    async fn fail_before_provisioned(&mut self, message: &str) {
        if self.send_status(StatusUpdate::error(message)).await.is_err() {
            return;
        }
        if self.conn.send(close_frame(close_code::NORMAL)).await.is_err() {
            return;
        }

        let limit = self.ctx.timeouts.drain;
        let conn = &mut *self.conn;
        let drain = async move { while let Some(Ok(_)) = conn.next().await {} };
        if tokio::time::timeout(limit, drain).await.is_err() {
            log::debug!(
                "Session {}: client did not disconnect within {:?}",
                self.id,
                limit
            );
        }
    }

    async fn close_connection(&mut self, code: u16) {
        if let Err(e) = self.conn.send(close_frame(code)).await {
            log::debug!("Session {}: close frame not sent: {}", self.id, e);
        }
    }
}

fn close_frame(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: "".into(),
    }))
}

/// Run one session of `kind` for `spec` over `conn`.
pub async fn run_session<C: ClientSocket>(
    ctx: &SessionContext,
    kind: SessionKind,
    spec: &EnvironmentSpec,
    conn: &mut C,
) -> SessionOutcome {
    let id = uuid::Uuid::new_v4().to_string();
    log::info!("Session {} ({}) started for image {}", id, kind, spec.image);
    let session = Session {
        id: id.clone(),
        kind,
        ctx,
        conn,
    };
    let outcome = session.run(spec).await;
    log::info!("Session {} ended: {:?}", id, outcome);
    outcome
}
