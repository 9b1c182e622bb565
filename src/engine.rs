use boxwright_invoker::{DockerRuntime, Launcher, LocalRuntime};
use boxwright_models::{
    BaseImage, BoxError, Config, EngineKind, ImageArtifact, LaunchOutcome, Recipe,
};
use boxwright_packaging::{
    connect_docker, default_tag, BuildContext, DockerBackend, ImageBuilder, LocalBackend,
    LocalStore,
};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// A matched image backend and container runtime.
pub struct Engine {
    kind: EngineKind,
    builder: ImageBuilder,
    launcher: Launcher,
    store: Option<LocalStore>,
}

impl Engine {
    pub fn from_config(config: &Config) -> Result<Self, BoxError> {
        match config.engine.kind {
            EngineKind::Docker => {
                let docker = connect_docker(&config.engine.docker_host)?;
                Ok(Self {
                    kind: EngineKind::Docker,
                    builder: ImageBuilder::new(Arc::new(DockerBackend::new(docker.clone()))),
                    launcher: Launcher::new(Arc::new(DockerRuntime::new(docker))),
                    store: None,
                })
            }
            EngineKind::Local => Ok(Self::local(LocalStore::open(&config.store.dir)?)),
        }
    }

    pub fn local(store: LocalStore) -> Self {
        Self {
            kind: EngineKind::Local,
            builder: ImageBuilder::new(Arc::new(LocalBackend::new(store.clone()))),
            launcher: Launcher::new(Arc::new(LocalRuntime::new(store.clone()))),
            store: Some(store),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Build `context_dir` with `recipe`, tagging it `tag` or the
    /// directory's default tag.
    pub async fn build(
        &self,
        context_dir: &Path,
        recipe: Recipe,
        tag: Option<&str>,
    ) -> Result<ImageArtifact, BoxError> {
        let tag = tag
            .map(str::to_string)
            .unwrap_or_else(|| default_tag(context_dir));
        let context = BuildContext::open(context_dir, recipe)?;
        self.builder.build_image(context, &tag).await
    }

    pub async fn inspect(&self, tag: &str) -> Result<ImageArtifact, BoxError> {
        self.builder.lookup(tag).await
    }

    pub async fn run(&self, tag: &str) -> Result<LaunchOutcome, BoxError> {
        let artifact = self.builder.lookup(tag).await?;
        self.launcher.launch(&artifact).await
    }

    pub fn import_base(&self, image: &BaseImage, dir: &Path) -> Result<u64, BoxError> {
        let store = self.store.as_ref().ok_or_else(|| BoxError::ConfigError {
            reason: "import-base needs the local engine".to_string(),
        })?;
        let files = store.import_base(image, dir)?;
        info!(image = %image, files, "Base image ready");
        Ok(files)
    }

    /// Drop cached layers no published image references.
    pub fn prune(&self) -> Result<usize, BoxError> {
        let store = self.store.as_ref().ok_or_else(|| BoxError::ConfigError {
            reason: "prune needs the local engine".to_string(),
        })?;
        store.prune()
    }
}
