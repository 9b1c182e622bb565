use crate::runtime::{ContainerRuntime, CreateSpec};
use boxwright_models::{BoxError, ImageArtifact, LaunchOutcome};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Runs an artifact's entry command to completion in a fresh container and
/// removes the container afterwards, whatever the outcome.
pub struct Launcher {
    runtime: Arc<dyn ContainerRuntime>,
}

impl Launcher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    #[instrument(skip(self, artifact), fields(image = %artifact.tag, runtime = self.runtime.name()))]
    pub async fn launch(&self, artifact: &ImageArtifact) -> Result<LaunchOutcome, BoxError> {
        let spec = CreateSpec::for_artifact(artifact);
        info!(
            command = ?spec.command,
            working_dir = %spec.working_dir,
            "Launching container"
        );

        let container_id = self.runtime.create(spec).await.map_err(classify)?;
        let result = self.start_and_wait(&container_id).await;

        if let Err(e) = self.runtime.remove(&container_id).await {
            warn!(container_id = %container_id, "Failed to remove container: {:#}", e);
        }

        let exit_code = result.map_err(classify)?;
        info!(container_id = %container_id, exit_code, "Container exited");
        Ok(LaunchOutcome {
            container_id,
            exit_code,
        })
    }

    async fn start_and_wait(&self, container_id: &str) -> anyhow::Result<i64> {
        self.runtime.start(container_id).await?;
        self.runtime.wait(container_id).await
    }
}

fn classify(e: anyhow::Error) -> BoxError {
    match e.downcast::<BoxError>() {
        Ok(e) => e,
        Err(e) => BoxError::LaunchError {
            reason: format!("{e:#}"),
        },
    }
}
