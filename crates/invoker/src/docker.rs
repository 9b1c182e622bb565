use crate::runtime::{ContainerRuntime, CreateSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerApiError;
use bollard::models::{ContainerCreateResponse, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use boxwright_models::BoxError;
use futures_util::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

struct Tracked {
    program: String,
    logs: Option<JoinHandle<()>>,
}

/// Runs containers through the Docker daemon, relaying their output to this
/// process's stdout and stderr.
pub struct DockerRuntime {
    docker: Docker,
    containers: Mutex<HashMap<String, Tracked>>,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            containers: Mutex::new(HashMap::new()),
        }
    }

    fn follow_logs(&self, container_id: &str) -> JoinHandle<()> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));

        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            while let Some(log) = stream.next().await {
                let written = match log {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.write_all(&message).await
                    }
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(e) => {
                        error!("Error reading container logs: {}", e);
                        break;
                    }
                };
                if written.is_err() {
                    break;
                }
            }
            let _ = stdout.flush().await;
            let _ = stderr.flush().await;
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create(&self, spec: CreateSpec) -> anyhow::Result<String> {
        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image_ref().to_string()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.iter().cloned().collect()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response: ContainerCreateResponse = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match e {
                DockerApiError::DockerResponseServerError {
                    status_code: 404, ..
                } => BoxError::ImageNotFound {
                    tag: spec.image_ref().to_string(),
                },
                e => BoxError::LaunchError {
                    reason: e.to_string(),
                },
            })?;

        info!("Created container: {} with ID: {}", spec.name, response.id);
        self.containers.lock().await.insert(
            response.id.clone(),
            Tracked {
                program: spec.program().to_string(),
                logs: None,
            },
        );
        Ok(response.id)
    }

    #[instrument(skip(self))]
    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        let options = StartContainerOptions::<String> {
            ..Default::default()
        };

        if let Err(e) = self.docker.start_container(container_id, Some(options)).await {
            let message = e.to_string();
            let program = self
                .containers
                .lock()
                .await
                .get(container_id)
                .map(|t| t.program.clone())
                .unwrap_or_default();
            if message.contains("executable file not found")
                || message.contains("no such file or directory")
            {
                return Err(BoxError::EntryNotFound { program }.into());
            }
            return Err(BoxError::LaunchError { reason: message }.into());
        }

        let logs = self.follow_logs(container_id);
        if let Some(tracked) = self.containers.lock().await.get_mut(container_id) {
            tracked.logs = Some(logs);
        }
        debug!("Started container: {}", container_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wait(&self, container_id: &str) -> anyhow::Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));

        let exit_code = match stream.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(DockerApiError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("wait stream for {container_id} ended without a status"),
        };

        let logs = self
            .containers
            .lock()
            .await
            .get_mut(container_id)
            .and_then(|t| t.logs.take());
        if let Some(logs) = logs {
            let _ = logs.await;
        }
        Ok(exit_code)
    }

    #[instrument(skip(self))]
    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        if let Some(tracked) = self.containers.lock().await.remove(container_id) {
            if let Some(logs) = tracked.logs {
                logs.abort();
            }
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await?;

        debug!("Removed container: {}", container_id);
        Ok(())
    }
}
