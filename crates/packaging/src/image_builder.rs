use crate::context::BuildContext;
use crate::digest::{layer_chain, ContextDigest};
use crate::dockerfile;
use async_trait::async_trait;
use boxwright_models::{BaseImage, BoxError, BuildStep, ImageArtifact, LayerRecord};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

/// Everything a backend needs to produce an artifact, computed up front
/// without side effects.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub context: BuildContext,
    pub tag: String,
    pub steps: Vec<BuildStep>,
    pub layers: Vec<LayerRecord>,
    pub digest: ContextDigest,
    pub dockerfile: String,
}

impl BuildPlan {
    /// Artifact record for this plan once the backend has an image id.
    pub fn artifact(&self, id: String) -> ImageArtifact {
        let recipe = self.context.recipe();
        ImageArtifact {
            id,
            tag: self.tag.clone(),
            base: recipe.base.clone(),
            workdir: recipe.workdir.clone(),
            entry: recipe.entry.clone(),
            manifest_sha256: self.digest.manifest_sha256.clone(),
            layers: self.layers.clone(),
            trees: self.digest.trees.clone(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// An engine that turns a plan into a published image. Implementations must
/// publish nothing under the plan's tag unless every step succeeded.
#[async_trait]
pub trait ImageBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn build(&self, plan: &BuildPlan) -> Result<ImageArtifact, BoxError>;
    async fn lookup(&self, tag: &str) -> Result<Option<ImageArtifact>, BoxError>;

    /// Content digest of the base image, folded into every layer key so a
    /// replaced base invalidates cached layers. `None` when unknown.
    fn base_digest(&self, _image: &BaseImage) -> Result<Option<String>, BoxError> {
        Ok(None)
    }
}

pub struct ImageBuilder {
    backend: Arc<dyn ImageBackend>,
}

impl ImageBuilder {
    pub fn new(backend: Arc<dyn ImageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ImageBackend> {
        &self.backend
    }

    pub fn plan(&self, context: BuildContext, tag: &str) -> Result<BuildPlan, BoxError> {
        validate_tag(tag)?;
        let mut digest = context.verify()?;
        digest.base_sha256 = self.backend.base_digest(&context.recipe().base)?;
        let steps = context.recipe().steps();
        let layers = layer_chain(&steps, &digest);
        let dockerfile = dockerfile::render(context.recipe());
        Ok(BuildPlan {
            context,
            tag: tag.to_string(),
            steps,
            layers,
            digest,
            dockerfile,
        })
    }

    #[instrument(skip(self, context), fields(backend = self.backend.name()))]
    pub async fn build_image(
        &self,
        context: BuildContext,
        tag: &str,
    ) -> Result<ImageArtifact, BoxError> {
        let started = Instant::now();
        let plan = self.plan(context, tag)?;
        info!(
            tag = %plan.tag,
            base = %plan.context.recipe().base,
            steps = plan.steps.len(),
            "Building image"
        );

        match self.backend.build(&plan).await {
            Ok(artifact) => {
                info!(
                    tag = %artifact.tag,
                    id = %artifact.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Built image"
                );
                Ok(artifact)
            }
            Err(e) => {
                error!(
                    tag = %plan.tag,
                    step = e.step().unwrap_or("-"),
                    error = %e,
                    "Image build failed"
                );
                Err(e)
            }
        }
    }

    pub async fn lookup(&self, tag: &str) -> Result<ImageArtifact, BoxError> {
        self.backend
            .lookup(tag)
            .await?
            .ok_or_else(|| BoxError::ImageNotFound {
                tag: tag.to_string(),
            })
    }
}

/// Accepts `[registry/]name[:tag]` with lowercase name components.
pub fn validate_tag(tag: &str) -> Result<(), BoxError> {
    let invalid = || BoxError::InvalidImageRef {
        reference: tag.to_string(),
    };
    let valid_char = |c: char| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/' | ':')
    };
    if tag.is_empty() || tag.len() > 255 || !tag.chars().all(valid_char) {
        return Err(invalid());
    }
    if tag.contains("..") || tag.starts_with('/') || tag.ends_with('/') || tag.ends_with(':') {
        return Err(invalid());
    }
    if tag.split('/').any(str::is_empty) {
        return Err(invalid());
    }
    Ok(())
}
