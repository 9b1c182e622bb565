use crate::image_builder::{BuildPlan, ImageBackend};
use async_trait::async_trait;
use bollard::errors::Error as DockerApiError;
use bollard::image::BuildImageOptions;
use bollard::Docker;
use boxwright_models::{BoxError, ImageArtifact};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, error, info, instrument};

/// Image label carrying the serialized artifact record.
pub const ARTIFACT_LABEL: &str = "boxwright.artifact";

/// Connect to the Docker daemon. An explicit `host` wins over `DOCKER_HOST`;
/// `tcp://` addresses use HTTP, anything else the local socket.
pub fn connect_docker(host: &str) -> Result<Docker, BoxError> {
    let host = if host.is_empty() {
        std::env::var("DOCKER_HOST").unwrap_or_default()
    } else {
        host.to_string()
    };

    let docker = if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
            BoxError::DockerError {
                message: format!("Failed to connect to Docker at {host}: {e}"),
            }
        })?
    } else if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
            BoxError::DockerError {
                message: format!("Failed to connect to Docker at {host}: {e}"),
            }
        })?
    } else {
        Docker::connect_with_socket_defaults().map_err(|e| BoxError::DockerError {
            message: e.to_string(),
        })?
    };
    Ok(docker)
}

/// Builds through the Docker daemon's build endpoint. Docker's own layer
/// cache provides step reuse; the step order of the rendered Dockerfile keeps
/// application changes from invalidating the install layer.
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ImageBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, plan), fields(tag = %plan.tag))]
    async fn build(&self, plan: &BuildPlan) -> Result<ImageArtifact, BoxError> {
        let archive = plan.context.archive(&plan.dockerfile)?;

        let record = plan.artifact(String::new());
        let label = serde_json::to_string(&record).map_err(|e| BoxError::InternalError {
            reason: e.to_string(),
        })?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: plan.tag.clone(),
            rm: true,
            forcerm: true,
            labels: HashMap::from([(ARTIFACT_LABEL.to_string(), label)]),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(archive).into()));

        let mut progress = StepProgress::new(plan);
        let mut image_id = None;

        while let Some(item) = stream.next().await {
            match item {
                Ok(info) => {
                    if let Some(line) = info.stream.as_deref() {
                        progress.observe(line);
                    }
                    if let Some(message) = info.error {
                        return Err(progress.failure(message));
                    }
                    if let Some(id) = info.aux.and_then(|aux| aux.id) {
                        image_id = Some(id);
                    }
                }
                Err(DockerApiError::DockerStreamError { error }) => {
                    return Err(progress.failure(error));
                }
                Err(e) => {
                    error!("Docker build stream failed: {}", e);
                    return Err(progress.failure(e.to_string()));
                }
            }
        }

        // Older daemons report the id only through the image itself.
        let id = match image_id {
            Some(id) => id,
            None => self
                .docker
                .inspect_image(&plan.tag)
                .await
                .map_err(|e| BoxError::DockerError {
                    message: e.to_string(),
                })?
                .id
                .unwrap_or_default(),
        };

        info!(id = %id, "Docker build complete");
        Ok(ImageArtifact { id, ..record })
    }

    async fn lookup(&self, tag: &str) -> Result<Option<ImageArtifact>, BoxError> {
        let image = match self.docker.inspect_image(tag).await {
            Ok(image) => image,
            Err(DockerApiError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(None),
            Err(e) => {
                return Err(BoxError::DockerError {
                    message: e.to_string(),
                })
            }
        };

        let label = image
            .config
            .and_then(|c| c.labels)
            .and_then(|mut labels| labels.remove(ARTIFACT_LABEL));
        let Some(label) = label else {
            debug!(tag, "Image has no artifact label");
            return Ok(None);
        };

        let record: ImageArtifact =
            serde_json::from_str(&label).map_err(|e| BoxError::InternalError {
                reason: format!("corrupt artifact label on {tag}: {e}"),
            })?;
        Ok(Some(ImageArtifact {
            id: image.id.unwrap_or(record.id.clone()),
            ..record
        }))
    }
}

/// Tracks `Step N/M` lines of the classic builder's output so a failure can
/// be attributed to the step that was running.
struct StepProgress<'a> {
    plan: &'a BuildPlan,
    current: Option<usize>,
    tail: Vec<String>,
}

impl<'a> StepProgress<'a> {
    const TAIL_LINES: usize = 20;

    fn new(plan: &'a BuildPlan) -> Self {
        Self {
            plan,
            current: None,
            tail: Vec::new(),
        }
    }

    fn observe(&mut self, chunk: &str) {
        for line in chunk.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if let Some(n) = parse_step_number(line) {
                self.current = Some(n - 1);
                self.tail.clear();
                info!("{}", line);
            } else {
                debug!(target: "boxwright::docker", "{}", line);
                if self.tail.len() == Self::TAIL_LINES {
                    self.tail.remove(0);
                }
                self.tail.push(line.to_string());
            }
        }
    }

    fn failure(&self, message: String) -> BoxError {
        let reason = if self.tail.is_empty() {
            message.trim().to_string()
        } else {
            format!("{}\n{}", message.trim(), self.tail.join("\n"))
        };
        match self.current.and_then(|i| self.plan.steps.get(i)) {
            Some(step) if step.name() == "base" => BoxError::BaseImageNotFound {
                image: self.plan.context.recipe().base.to_string(),
            },
            Some(step) => BoxError::StepFailed {
                step: step.name().to_string(),
                reason,
            },
            None => BoxError::DockerError { message: reason },
        }
    }
}

/// `Step 3/7 : RUN ...` gives `Some(3)`.
fn parse_step_number(line: &str) -> Option<usize> {
    let rest = line.strip_prefix("Step ")?;
    let (n, _) = rest.split_once('/')?;
    n.trim().parse().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContext;
    use crate::image_builder::ImageBuilder;
    use boxwright_models::Recipe;
    use boxwright_testsupport::SampleContext;
    use std::sync::Arc;

    struct NoBackend;

    #[async_trait]
    impl ImageBackend for NoBackend {
        fn name(&self) -> &'static str {
            "none"
        }
        async fn build(&self, _plan: &BuildPlan) -> Result<ImageArtifact, BoxError> {
            unreachable!()
        }
        async fn lookup(&self, _tag: &str) -> Result<Option<ImageArtifact>, BoxError> {
            Ok(None)
        }
    }

    fn plan(ctx: &SampleContext) -> BuildPlan {
        let builder = ImageBuilder::new(Arc::new(NoBackend));
        let context = BuildContext::open(ctx.path(), Recipe::default()).unwrap();
        builder.plan(context, "boxwright/app:latest").unwrap()
    }

    #[test]
    fn test_parse_step_number() {
        assert_eq!(parse_step_number("Step 3/7 : RUN pip install"), Some(3));
        assert_eq!(parse_step_number("Step 10/12 : COPY src ./src"), Some(10));
        assert_eq!(parse_step_number(" ---> Running in abc"), None);
        assert_eq!(parse_step_number("Step 0/7 : FROM x"), None);
    }

    #[test]
    fn test_failure_attributed_to_running_step() {
        let ctx = SampleContext::new().unwrap();
        let plan = plan(&ctx);
        let mut progress = StepProgress::new(&plan);

        progress.observe("Step 1/7 : FROM python:3.12-slim\n ---> 1a2b3c\n");
        progress.observe("Step 4/7 : RUN [\"pip\",\"install\"]\n");
        progress.observe("ERROR: No matching distribution found for boto4\n");

        let err = progress.failure(
            "The command '/bin/sh -c pip install' returned a non-zero code: 1".to_string(),
        );
        assert_eq!(err.step(), Some("install-dependencies"));
        assert!(err.to_string().contains("boto4"));
    }

    #[test]
    fn test_failure_on_from_is_missing_base() {
        let ctx = SampleContext::new().unwrap();
        let plan = plan(&ctx);
        let mut progress = StepProgress::new(&plan);
        progress.observe("Step 1/7 : FROM python:3.12-slim\n");

        let err = progress.failure("manifest unknown".to_string());
        assert!(matches!(err, BoxError::BaseImageNotFound { .. }));
    }

    #[test]
    fn test_failure_before_any_step() {
        let ctx = SampleContext::new().unwrap();
        let plan = plan(&ctx);
        let progress = StepProgress::new(&plan);
        let err = progress.failure("daemon unavailable".to_string());
        assert!(matches!(err, BoxError::DockerError { .. }));
    }

    #[cfg(feature = "docker_tests")]
    #[tokio::test]
    async fn test_docker_build_and_lookup() {
        let ctx = SampleContext::new().unwrap();
        let backend = Arc::new(DockerBackend::new(connect_docker("").unwrap()));
        let builder = ImageBuilder::new(backend);
        let mut recipe = Recipe::default();
        recipe.base = "alpine:3.19".parse().unwrap();
        recipe.install = vec!["sh".into(), "-c".into(), "cat requirements.txt".into()];
        recipe.entry = vec!["sh".into(), "-c".into(), "exit 0".into()];
        let context = BuildContext::open(ctx.path(), recipe).unwrap();

        let built = builder
            .build_image(context, "boxwright/docker-test:latest")
            .await
            .unwrap();
        let found = builder.lookup("boxwright/docker-test:latest").await.unwrap();
        assert_eq!(found.id, built.id);
        assert_eq!(found.layers, built.layers);
    }
}
