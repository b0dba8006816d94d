// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
    UploadToContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use bytes::Bytes;
use futures_util::stream::StreamExt;

use super::{AttachedStream, ContainerRuntime, CreateRequest};
use crate::errors::RuntimeError;

/// Seconds bollard waits on a single HTTP request before giving up. Session
/// deadlines are enforced separately, above this layer.
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// [`ContainerRuntime`] backed by the Docker Engine API.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform's default socket.
    pub fn connect_with_local_defaults() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Connect to an explicit engine address, `unix://`, `tcp://` or `http://`.
    pub fn connect(host: &str) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(path, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            return Err(RuntimeError::failed(format!(
                "unsupported Docker host '{}'",
                host
            )));
        };
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Bare image names are pulled from the Docker Hub library namespace.
pub fn qualified_image(image: &str) -> String {
    if image.contains('/') {
        image.to_string()
    } else {
        format!("docker.io/library/{}", image)
    }
}

fn container_config(request: &CreateRequest) -> ContainerCreateBody {
    ContainerCreateBody {
        image: Some(request.image.clone()),
        cmd: if request.command.is_empty() {
            None
        } else {
            Some(request.command.clone())
        },
        tty: Some(request.tty),
        open_stdin: Some(request.open_stdin),
        attach_stdin: Some(request.open_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(request.network_disabled),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, request: &CreateRequest) -> Result<String, RuntimeError> {
        let options = request
            .name
            .as_deref()
            .map(|name| CreateContainerOptionsBuilder::default().name(name).build());

        let container = self
            .docker
            .create_container(options, container_config(request))
            .await?;
        for warning in &container.warnings {
            log::warn!("Docker warning creating {}: {}", container.id, warning);
        }
        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<BollardStartContainerOptionsQuery>)
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> Result<AttachedStream, RuntimeError> {
        let options = AttachContainerOptionsBuilder::default()
            .stdin(true)
            .stdout(true)
            .stderr(true)
            .stream(true)
            .build();

        let attached = self.docker.attach_container(id, Some(options)).await?;
        let output = attached
            .output
            .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(RuntimeError::from))
            .boxed();

        Ok(AttachedStream {
            output,
            input: attached.input,
        })
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn copy_archive_into(
        &self,
        id: &str,
        dest: &str,
        archive: Bytes,
    ) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptionsBuilder::default().path(dest).build();
        self.docker
            .upload_to_container(id, Some(options), bollard::body_full(archive))
            .await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let from_image = qualified_image(image);
        let options = CreateImageOptionsBuilder::default()
            .from_image(&from_image)
            .build();

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            let info = info?;
            if let Some(status) = info.status {
                match info.progress {
                    Some(bar) => log::debug!("{}: {} {}", from_image, status, bar),
                    None => log::info!("{}: {}", from_image, status),
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_image() {
        assert_eq!(qualified_image("python:3"), "docker.io/library/python:3");
        assert_eq!(qualified_image("ghcr.io/org/img:1"), "ghcr.io/org/img:1");
        assert_eq!(qualified_image("org/img"), "org/img");
    }

    #[test]
    fn test_container_config_for_interactive_sandbox() {
        let request = CreateRequest {
            name: Some("runbox-test".to_string()),
            image: "alpine".to_string(),
            command: vec!["sh".to_string()],
            tty: true,
            open_stdin: true,
            network_disabled: true,
        };
        let config = container_config(&request);
        assert_eq!(config.image.as_deref(), Some("alpine"));
        assert_eq!(config.cmd, Some(vec!["sh".to_string()]));
        assert_eq!(config.tty, Some(true));
        assert_eq!(config.open_stdin, Some(true));
        assert_eq!(config.network_disabled, Some(true));
    }

    #[test]
    fn test_container_config_keeps_image_default_command() {
        let request = CreateRequest {
            name: None,
            image: "alpine".to_string(),
            command: Vec::new(),
            tty: true,
            open_stdin: true,
            network_disabled: true,
        };
        assert_eq!(container_config(&request).cmd, None);
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        assert!(matches!(
            DockerRuntime::connect("ftp://example"),
            Err(RuntimeError::Failed(_))
        ));
    }
}
