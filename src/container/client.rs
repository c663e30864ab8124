//! Docker/Podman client wrapper.
//!
//! Connects to the container runtime with automatic fallback: Docker local
//! defaults first, then rootless and system Podman sockets. Also probes the
//! runtime's security posture so the sandbox façade can report facts.

use super::{ContainerError, Result};
use bollard::Docker;
use futures::stream::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Security posture of the connected runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityFacts {
    /// Runtime supports seccomp filtering
    pub seccomp: bool,
    /// Runtime runs rootless
    pub rootless: bool,
}

/// Container runtime API client.
#[derive(Clone)]
pub struct RuntimeClient {
    docker: Arc<Docker>,
}

impl RuntimeClient {
    /// Connect to Docker or Podman.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::RuntimeUnavailable`] when no runtime
    /// answers a ping.
    pub async fn connect() -> Result<Self> {
        let docker = Self::try_connect()?;
        let client = Self {
            docker: Arc::new(docker),
        };
        client.ping().await?;
        Ok(client)
    }

    fn try_connect() -> Result<Docker> {
        debug!("connecting to container runtime");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => debug!("local defaults failed: {e}"),
        }

        #[cfg(unix)]
        {
            if let Ok(home) = std::env::var("HOME") {
                let socket = format!("unix://{home}/run/podman/podman.sock");
                match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(docker) => {
                        info!("connected to Podman via rootless socket");
                        return Ok(docker);
                    }
                    Err(e) => debug!("rootless Podman socket failed: {e}"),
                }
            }

            let socket = "unix:///run/podman/podman.sock";
            match Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(e) => debug!("system Podman socket failed: {e}"),
            }
        }

        Err(ContainerError::RuntimeUnavailable(
            "no Docker or Podman daemon reachable".to_string(),
        ))
    }

    /// Verify the runtime answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| ContainerError::RuntimeUnavailable(format!("ping failed: {e}")))?;
        Ok(())
    }

    /// Probe the runtime's security options.
    pub async fn security_facts(&self) -> SecurityFacts {
        match self.docker.info().await {
            Ok(info) => {
                let options = info.security_options.unwrap_or_default();
                SecurityFacts {
                    seccomp: options.iter().any(|o| o.contains("seccomp")),
                    rootless: options.iter().any(|o| o.contains("rootless")),
                }
            }
            Err(e) => {
                debug!("runtime info query failed: {e}");
                SecurityFacts::default()
            }
        }
    }

    /// Whether `image` is present locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Pull `image` unless it is already present.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::ImageUnavailable`] when the pull fails.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await {
            debug!(image, "image already present");
            return Ok(());
        }

        info!(image, "pulling image");
        let mut stream = self.docker.create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            match progress {
                Ok(step) => {
                    if let Some(status) = step.status {
                        debug!(image, "pull: {status}");
                    }
                }
                Err(e) => {
                    return Err(ContainerError::ImageUnavailable(format!(
                        "pull of '{image}' failed: {e}"
                    )));
                }
            }
        }

        info!(image, "image pulled");
        Ok(())
    }

    /// The underlying bollard handle.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}
