use crate::digest::{file_sha256, tree_digest, ContextDigest};
use boxwright_models::{BoxError, Recipe};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// The local files a build may read. Nothing outside the manifest and the
/// recipe's trees is ever read, and nothing in the context is written.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    recipe: Recipe,
}

impl BuildContext {
    pub fn open(root: impl Into<PathBuf>, recipe: Recipe) -> Result<Self, BoxError> {
        let root = root.into();
        recipe.validate()?;
        if !root.is_dir() {
            return Err(BoxError::ContextNotFound {
                path: root.display().to_string(),
            });
        }
        Ok(Self { root, recipe })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.recipe.manifest)
    }

    pub fn tree_path(&self, source: &str) -> PathBuf {
        self.root.join(source)
    }

    /// Checks every input exists and is readable and digests it. Failures
    /// name the step that would have consumed the input.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn verify(&self) -> Result<ContextDigest, BoxError> {
        let manifest = self.manifest_path();
        if !manifest.is_file() {
            return Err(BoxError::MissingInput {
                step: "copy-manifest".to_string(),
                path: self.recipe.manifest.clone(),
            });
        }
        let manifest_sha256 =
            file_sha256(&manifest).map_err(|e| unreadable("copy-manifest", &self.recipe.manifest, e))?;

        let mut trees = Vec::with_capacity(self.recipe.trees.len());
        for tree in &self.recipe.trees {
            let path = self.tree_path(&tree.source);
            if !path.is_dir() {
                return Err(BoxError::MissingInput {
                    step: "copy-tree".to_string(),
                    path: tree.source.clone(),
                });
            }
            let digest = tree_digest(&path, &tree.destination)
                .map_err(|e| unreadable("copy-tree", &tree.source, e))?;
            debug!(
                source = %tree.source,
                files = digest.files,
                sha256 = %digest.sha256,
                "Digested tree"
            );
            trees.push(digest);
        }

        Ok(ContextDigest {
            manifest_sha256,
            trees,
            base_sha256: None,
        })
    }

    /// Gzip'd tar holding the Dockerfile, the manifest and the trees. Entry
    /// permissions are kept as-is and symlinks are archived as symlinks.
    #[instrument(skip(self, dockerfile))]
    pub fn archive(&self, dockerfile: &str) -> Result<Vec<u8>, BoxError> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.mode(tar::HeaderMode::Complete);
        builder.follow_symlinks(false);

        let mut header = tar::Header::new_gnu();
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;

        builder
            .append_path_with_name(self.manifest_path(), &self.recipe.manifest)
            .map_err(|e| unreadable("copy-manifest", &self.recipe.manifest, e))?;

        for tree in &self.recipe.trees {
            let source = tree.source.trim_end_matches('/');
            builder
                .append_dir_all(source, self.tree_path(source))
                .map_err(|e| unreadable("copy-tree", &tree.source, e))?;
        }

        let encoder = builder.into_inner()?;
        let bytes = encoder.finish()?;
        debug!(bytes = bytes.len(), "Archived build context");
        Ok(bytes)
    }
}

/// Default image tag for a context directory: `boxwright/<dir name>:latest`.
pub fn default_tag(root: &Path) -> String {
    let name = fs::canonicalize(root)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string());
    let name: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches(|c| c == '-' || c == '.' || c == '_');
    let name = if name.is_empty() { "app" } else { name };
    format!("boxwright/{name}:latest")
}

fn unreadable(step: &str, path: &str, e: io::Error) -> BoxError {
    BoxError::UnreadableInput {
        step: step.to_string(),
        path: path.to_string(),
        reason: e.to_string(),
    }
}
