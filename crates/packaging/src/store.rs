use crate::digest::tree_digest;
use crate::fsutil::{copy_tree, replace_dir};
use boxwright_models::{BaseImage, BoxError, ImageArtifact};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

pub const ARTIFACT_FILE: &str = "artifact.json";
pub const ROOTFS_DIR: &str = "rootfs";
const BASE_DIGEST_FILE: &str = "rootfs.sha256";

/// Directory-backed image store for the local engine.
///
/// ```text
/// <root>/bases/<name>/<tag>/rootfs     imported base filesystems
/// <root>/bases/<name>/<tag>/rootfs.sha256  content digest of that rootfs
/// <root>/layers/<key>/                 filesystem snapshot after a step
/// <root>/images/<tag>/rootfs           published image filesystem
/// <root>/images/<tag>/artifact.json    published image record
/// <root>/instances/<id>/               per-launch filesystem copies
/// <root>/tmp/                          staging, same filesystem as the rest
/// ```
///
/// Everything enters `bases/`, `layers/` and `images/` by rename from
/// `tmp/`, so readers never observe a partially written entry. Layers no
/// published image references are removed by [`LocalStore::prune`].
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BoxError> {
        let store = Self { root: root.into() };
        for dir in ["bases", "layers", "images", "instances", "tmp"] {
            fs::create_dir_all(store.root.join(dir)).map_err(|e| BoxError::ConfigError {
                reason: format!("cannot create store at {}: {e}", store.root.display()),
            })?;
        }
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    fn base_dir(&self, image: &BaseImage) -> PathBuf {
        self.root
            .join("bases")
            .join(escape(&image.name))
            .join(escape(&image.tag))
    }

    pub fn base_rootfs(&self, image: &BaseImage) -> PathBuf {
        self.base_dir(image).join(ROOTFS_DIR)
    }

    /// Content digest recorded when `image` was imported. `None` for a base
    /// that was never imported.
    pub fn base_digest(&self, image: &BaseImage) -> Result<Option<String>, BoxError> {
        let path = self.base_dir(image).join(BASE_DIGEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?.trim().to_string()))
    }

    pub fn layer_path(&self, key: &str) -> PathBuf {
        self.root.join("layers").join(key)
    }

    pub fn image_dir(&self, tag: &str) -> PathBuf {
        self.root.join("images").join(escape(tag))
    }

    pub fn image_rootfs(&self, tag: &str) -> PathBuf {
        self.image_dir(tag).join(ROOTFS_DIR)
    }

    /// A fresh staging directory under `tmp/`, removed on drop.
    pub fn staging(&self, prefix: &str) -> Result<TempDir, BoxError> {
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(self.tmp_dir())?)
    }

    /// Copy `source` in as the root filesystem of `image`, replacing any
    /// previous import.
    #[instrument(skip(self))]
    pub fn import_base(&self, image: &BaseImage, source: &Path) -> Result<u64, BoxError> {
        if !source.is_dir() {
            return Err(BoxError::ContextNotFound {
                path: source.display().to_string(),
            });
        }
        let staging = self.staging("base-")?;
        let staged = staging.path().join("base");
        let rootfs = staged.join(ROOTFS_DIR);
        let files = copy_tree(source, &rootfs)?;
        let digest = tree_digest(&rootfs, "/")?;
        fs::write(staged.join(BASE_DIGEST_FILE), &digest.sha256)?;
        replace_dir(
            &staged,
            &self.base_dir(image),
            &staging.path().join("retired"),
        )?;
        info!(image = %image, files, sha256 = %digest.sha256, "Imported base image");
        Ok(files)
    }

    /// Snapshot `rootfs` as the layer `key`. An existing snapshot wins.
    pub fn save_layer(&self, key: &str, rootfs: &Path) -> Result<(), BoxError> {
        let target = self.layer_path(key);
        if target.is_dir() {
            return Ok(());
        }
        let staging = self.staging("layer-")?;
        let staged = staging.path().join("layer");
        copy_tree(rootfs, &staged)?;
        if let Err(e) = fs::rename(&staged, &target) {
            if !target.is_dir() {
                return Err(e.into());
            }
        }
        debug!(key, "Saved layer");
        Ok(())
    }

    /// Move a fully staged image directory (rootfs + record) into place.
    pub fn publish(&self, staged_image: &Path, tag: &str) -> Result<(), BoxError> {
        let retired = self.staging("retired-")?;
        replace_dir(
            staged_image,
            &self.image_dir(tag),
            &retired.path().join("image"),
        )?;
        Ok(())
    }

    pub fn read_artifact(&self, tag: &str) -> Result<Option<ImageArtifact>, BoxError> {
        let path = self.image_dir(tag).join(ARTIFACT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)?;
        let artifact = serde_json::from_str(&data).map_err(|e| BoxError::InternalError {
            reason: format!("corrupt artifact record {}: {e}", path.display()),
        })?;
        Ok(Some(artifact))
    }

    /// Published artifacts, ordered by tag.
    pub fn list_artifacts(&self) -> Result<Vec<ImageArtifact>, BoxError> {
        let mut artifacts = Vec::new();
        for entry in fs::read_dir(self.root.join("images"))? {
            let entry = entry?;
            let path = entry.path().join(ARTIFACT_FILE);
            if !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|d| serde_json::from_str::<ImageArtifact>(&d).map_err(|e| e.to_string()))
            {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable artifact"),
            }
        }
        artifacts.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(artifacts)
    }

    /// Remove every layer snapshot that no published artifact references.
    /// Returns the number of layers removed.
    #[instrument(skip(self))]
    pub fn prune(&self) -> Result<usize, BoxError> {
        let live: HashSet<String> = self
            .list_artifacts()?
            .into_iter()
            .flat_map(|artifact| artifact.layers.into_iter().map(|layer| layer.key))
            .collect();

        let retired = self.staging("retired-")?;
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join("layers"))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name.to_str() else {
                continue;
            };
            if live.contains(key) {
                continue;
            }
            fs::rename(entry.path(), retired.path().join(key))?;
            removed += 1;
        }
        retired.close()?;

        if removed > 0 {
            info!(removed, "Pruned unreferenced layers");
        }
        Ok(removed)
    }

    pub fn remove_image(&self, tag: &str) -> Result<bool, BoxError> {
        let dir = self.image_dir(tag);
        if !dir.exists() {
            return Ok(false);
        }
        let retired = self.staging("retired-")?;
        fs::rename(&dir, retired.path().join("image"))?;
        info!(tag, "Removed image");
        Ok(true)
    }
}

/// Map an image reference onto a single path component.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
        } else {
            out.push_str(&format!("%{:02X}", c as u32));
        }
    }
    if out.starts_with('.') {
        out.replace_range(0..1, "%2E");
    }
    out
}
