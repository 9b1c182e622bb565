use crate::fsutil::{blocking, copy_tree};
use crate::image_builder::{BuildPlan, ImageBackend};
use crate::store::{LocalStore, ARTIFACT_FILE, ROOTFS_DIR};
use async_trait::async_trait;
use boxwright_models::{BaseImage, BoxError, BuildStep, ImageArtifact, Recipe};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Variable naming the image root filesystem while the install command runs.
pub const ROOTFS_ENV: &str = "BOXWRIGHT_ROOTFS";

const STDERR_TAIL: usize = 2048;

/// Builds images as directories in a [`LocalStore`]. Steps run on the host:
/// the install command executes with the image working directory as its
/// current directory and [`ROOTFS_ENV`] pointing at the image root.
pub struct LocalBackend {
    store: LocalStore,
}

impl LocalBackend {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Index of the deepest filesystem step whose snapshot is already stored.
    fn resume_point(&self, plan: &BuildPlan) -> Option<usize> {
        plan.layers
            .iter()
            .enumerate()
            .rev()
            .find(|(i, layer)| {
                plan.steps[*i].touches_filesystem() && self.store.layer_path(&layer.key).is_dir()
            })
            .map(|(i, _)| i)
    }

    async fn run_step(
        &self,
        plan: &BuildPlan,
        step: &BuildStep,
        rootfs: &Path,
    ) -> Result<(), BoxError> {
        let recipe = plan.context.recipe();
        let workdir = workdir_path(rootfs, recipe);

        match step {
            BuildStep::Base { .. } | BuildStep::Entry { .. } => Ok(()),
            BuildStep::Workdir { .. } => {
                fs::create_dir_all(&workdir).map_err(|e| step_failed(step, e))
            }
            BuildStep::CopyManifest { .. } => {
                let from = plan.context.manifest_path();
                let to = workdir.join(recipe.manifest_destination());
                blocking(move || {
                    fs::copy(&from, &to).map_err(|e| BoxError::UnreadableInput {
                        step: "copy-manifest".to_string(),
                        path: from.display().to_string(),
                        reason: e.to_string(),
                    })?;
                    Ok(())
                })
                .await
            }
            BuildStep::InstallDependencies { command } => {
                run_install(command, &workdir, rootfs).await
            }
            BuildStep::CopyTree(tree) => {
                let from = plan.context.tree_path(&tree.source);
                let to = workdir.join(tree.destination.trim_end_matches('/'));
                let source = tree.source.clone();
                blocking(move || {
                    copy_tree(&from, &to).map_err(|e| BoxError::UnreadableInput {
                        step: "copy-tree".to_string(),
                        path: source,
                        reason: e.to_string(),
                    })
                })
                .await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ImageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, plan), fields(tag = %plan.tag))]
    async fn build(&self, plan: &BuildPlan) -> Result<ImageArtifact, BoxError> {
        let recipe = plan.context.recipe();
        let base_rootfs = self.store.base_rootfs(&recipe.base);
        if !base_rootfs.is_dir() {
            return Err(BoxError::BaseImageNotFound {
                image: recipe.base.to_string(),
            });
        }

        // Dropping the staging directory on any early return discards the
        // partial image.
        let staging = self.store.staging("build-")?;
        let image_dir = staging.path().join("image");
        let rootfs = image_dir.join(ROOTFS_DIR);

        let resume = self.resume_point(plan);
        let start_from = match resume {
            Some(i) => {
                info!(step = plan.steps[i].name(), "Resuming from cached layer");
                self.store.layer_path(&plan.layers[i].key)
            }
            None => base_rootfs,
        };
        {
            let rootfs = rootfs.clone();
            blocking(move || Ok(copy_tree(&start_from, &rootfs)?)).await?;
        }

        for (i, step) in plan.steps.iter().enumerate() {
            let layer = &plan.layers[i];
            if resume.is_some_and(|r| i <= r) {
                debug!(step = %step, key = %layer.key, "Using cache");
                continue;
            }
            info!(step = %step, "Running step {}/{}", i + 1, plan.steps.len());
            self.run_step(plan, step, &rootfs).await?;

            if step.touches_filesystem() {
                let store = self.store.clone();
                let key = layer.key.clone();
                let rootfs = rootfs.clone();
                blocking(move || store.save_layer(&key, &rootfs)).await?;
            }
        }

        let id = plan
            .layers
            .last()
            .map(|l| format!("sha256:{}", l.key))
            .unwrap_or_default();
        let artifact = plan.artifact(id);
        let record = serde_json::to_string_pretty(&artifact).map_err(|e| {
            BoxError::InternalError {
                reason: e.to_string(),
            }
        })?;
        fs::write(image_dir.join(ARTIFACT_FILE), record)?;

        let store = self.store.clone();
        let tag = plan.tag.clone();
        blocking(move || store.publish(&image_dir, &tag)).await?;
        drop(staging);

        // Layers of the image this one replaced are now unreferenced.
        let store = self.store.clone();
        if let Err(e) = blocking(move || store.prune()).await {
            warn!(error = %e, "Layer pruning failed");
        }

        Ok(artifact)
    }

    async fn lookup(&self, tag: &str) -> Result<Option<ImageArtifact>, BoxError> {
        self.store.read_artifact(tag)
    }

    fn base_digest(&self, image: &BaseImage) -> Result<Option<String>, BoxError> {
        self.store.base_digest(image)
    }
}

fn workdir_path(rootfs: &Path, recipe: &Recipe) -> PathBuf {
    rootfs.join(recipe.workdir.trim_start_matches('/'))
}

fn step_failed(step: &BuildStep, e: impl std::fmt::Display) -> BoxError {
    BoxError::StepFailed {
        step: step.name().to_string(),
        reason: e.to_string(),
    }
}

async fn run_install(command: &[String], workdir: &Path, rootfs: &Path) -> Result<(), BoxError> {
    let step = "install-dependencies";
    let output = Command::new(&command[0])
        .args(&command[1..])
        .current_dir(workdir)
        .env(ROOTFS_ENV, rootfs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| BoxError::StepFailed {
            step: step.to_string(),
            reason: format!("cannot run {}: {e}", command[0]),
        })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(target: "boxwright::install", "{}", line);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail_start = stderr
            .char_indices()
            .rev()
            .nth(STDERR_TAIL)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let tail = stderr[tail_start..].trim();
        warn!(status = %output.status, "Dependency installation failed");
        return Err(BoxError::StepFailed {
            step: step.to_string(),
            reason: if tail.is_empty() {
                format!("{}", output.status)
            } else {
                format!("{}: {}", output.status, tail)
            },
        });
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::BuildContext;
    use crate::digest::tree_digest;
    use crate::image_builder::ImageBuilder;
    use boxwright_testsupport::{assert_same_tree, base_rootfs, shell_recipe, test_base, SampleContext};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const TAG: &str = "boxwright/sample:latest";

    struct Fixture {
        root: TempDir,
        store: LocalStore,
        builder: ImageBuilder,
        ctx: SampleContext,
    }

    fn fixture() -> Fixture {
        let store_dir = tempdir().unwrap();
        let store = LocalStore::open(store_dir.path()).unwrap();
        let base = base_rootfs().unwrap();
        store.import_base(&test_base(), base.path()).unwrap();
        let builder = ImageBuilder::new(Arc::new(LocalBackend::new(store.clone())));
        Fixture {
            root: store_dir,
            store,
            builder,
            ctx: SampleContext::new().unwrap(),
        }
    }

    fn counting_install(counter: &Path) -> String {
        format!(
            "echo run >> '{}' && cp requirements.txt \"$BOXWRIGHT_ROOTFS/usr/local/lib/installed.txt\"",
            counter.display()
        )
    }

    async fn build(f: &Fixture, recipe: Recipe) -> Result<ImageArtifact, BoxError> {
        let context = BuildContext::open(f.ctx.path(), recipe).unwrap();
        f.builder.build_image(context, TAG).await
    }

    fn runs(counter: &Path) -> usize {
        fs::read_to_string(counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_trees_are_copied_byte_for_byte() {
        let f = fixture();
        let artifact = build(&f, shell_recipe("true", "exit 0")).await.unwrap();

        let app = f.store.image_rootfs(TAG).join("app");
        assert_same_tree(&f.ctx.join("src"), &app.join("src")).unwrap();
        assert_same_tree(&f.ctx.join("additional-files"), &app.join("additional-files")).unwrap();
        assert_eq!(
            fs::read(app.join("requirements.txt")).unwrap(),
            fs::read(f.ctx.join("requirements.txt")).unwrap()
        );
        assert!(!app.join("notes.txt").exists());
        for tree in &artifact.trees {
            let staged = tree_digest(&app.join(&tree.destination), &tree.destination).unwrap();
            assert_eq!(&staged, tree);
        }
        assert!(f.store.image_rootfs(TAG).join("etc/os-release").is_file());

        assert!(artifact.id.starts_with("sha256:"));
        assert_eq!(artifact.workdir, "/app");
        assert_eq!(f.store.read_artifact(TAG).unwrap(), Some(artifact));
    }

    #[tokio::test]
    async fn test_install_runs_in_workdir_against_rootfs() {
        let f = fixture();
        let counter = f.root.path().join("count");
        build(&f, shell_recipe(&counting_install(&counter), "exit 0"))
            .await
            .unwrap();

        assert_eq!(runs(&counter), 1);
        let installed = f.store.image_rootfs(TAG).join("usr/local/lib/installed.txt");
        assert_eq!(
            fs::read(installed).unwrap(),
            fs::read(f.ctx.join("requirements.txt")).unwrap()
        );
    }

    #[tokio::test]
    async fn test_app_change_reuses_install_layer() {
        let f = fixture();
        let counter = f.root.path().join("count");
        let recipe = shell_recipe(&counting_install(&counter), "exit 0");

        let first = build(&f, recipe.clone()).await.unwrap();
        f.ctx.write("src/main.py", "print('changed')\n").unwrap();
        let second = build(&f, recipe.clone()).await.unwrap();

        assert_eq!(runs(&counter), 1);
        assert_eq!(
            first.layer("install-dependencies").map(|l| &l.key),
            second.layer("install-dependencies").map(|l| &l.key)
        );
        assert_ne!(first.id, second.id);
        assert_eq!(
            fs::read_to_string(f.store.image_rootfs(TAG).join("app/src/main.py")).unwrap(),
            "print('changed')\n"
        );

        // A manifest change invalidates the install layer.
        f.ctx.write("requirements.txt", "boto3==1.35.0\n").unwrap();
        build(&f, recipe).await.unwrap();
        assert_eq!(runs(&counter), 2);
    }

    #[tokio::test]
    async fn test_reimported_base_invalidates_cache() {
        let f = fixture();
        let recipe = shell_recipe("true", "exit 0");
        let first = build(&f, recipe.clone()).await.unwrap();

        let base = base_rootfs().unwrap();
        fs::write(base.path().join("etc/os-release"), "ID=boxwright-next\n").unwrap();
        fs::write(base.path().join("etc/motd"), "patched\n").unwrap();
        f.store.import_base(&test_base(), base.path()).unwrap();
        let second = build(&f, recipe).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_ne!(first.layers[0].key, second.layers[0].key);
        let rootfs = f.store.image_rootfs(TAG);
        assert_eq!(
            fs::read_to_string(rootfs.join("etc/os-release")).unwrap(),
            "ID=boxwright-next\n"
        );
        assert!(rootfs.join("etc/motd").is_file());
        assert!(rootfs.join("app/src/main.py").is_file());
    }

    #[tokio::test]
    async fn test_app_edits_leave_only_live_layers() {
        let f = fixture();
        let recipe = shell_recipe("true", "exit 0");
        let mut last = None;
        for round in 0..5 {
            f.ctx
                .write("src/main.py", &format!("print({round})\n"))
                .unwrap();
            last = Some(build(&f, recipe.clone()).await.unwrap());
        }
        let last = last.unwrap();

        let on_disk: std::collections::HashSet<String> =
            fs::read_dir(f.root.path().join("layers"))
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
        let filesystem_steps = recipe
            .steps()
            .iter()
            .filter(|s| s.touches_filesystem())
            .count();
        assert_eq!(on_disk.len(), filesystem_steps);
        assert!(on_disk
            .iter()
            .all(|key| last.layers.iter().any(|l| &l.key == key)));
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let f = fixture();
        let recipe = shell_recipe("true", "exit 0");
        let first = build(&f, recipe.clone()).await.unwrap();
        let second = build(&f, recipe).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.layers, second.layers);
        assert_eq!(first.trees, second.trees);
        assert_eq!(f.store.list_artifacts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_install_publishes_nothing() {
        let f = fixture();
        let err = build(&f, shell_recipe("echo broken wheel >&2; exit 3", "exit 0"))
            .await
            .unwrap_err();

        match &err {
            BoxError::StepFailed { step, reason } => {
                assert_eq!(step, "install-dependencies");
                assert!(reason.contains("broken wheel"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(f.store.read_artifact(TAG).unwrap().is_none());
        assert!(!f.store.image_dir(TAG).exists());
        assert_eq!(fs::read_dir(f.store.tmp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous_image() {
        let f = fixture();
        let good = build(&f, shell_recipe("true", "exit 0")).await.unwrap();
        build(&f, shell_recipe("exit 1", "exit 0")).await.unwrap_err();

        assert_eq!(f.store.read_artifact(TAG).unwrap(), Some(good));
        assert!(f.store.image_rootfs(TAG).join("app/src/main.py").is_file());
    }

    #[tokio::test]
    async fn test_missing_install_program() {
        let f = fixture();
        let mut recipe = shell_recipe("true", "exit 0");
        recipe.install = vec!["boxwright-no-such-installer".to_string()];
        let err = build(&f, recipe).await.unwrap_err();
        assert_eq!(err.step(), Some("install-dependencies"));
    }

    #[tokio::test]
    async fn test_missing_base_image() {
        let f = fixture();
        let mut recipe = shell_recipe("true", "exit 0");
        recipe.base = boxwright_models::BaseImage::new("unknown", "0.1");
        let err = build(&f, recipe).await.unwrap_err();
        assert!(matches!(err, BoxError::BaseImageNotFound { .. }));
        assert_eq!(err.step(), Some("base"));
    }
}
