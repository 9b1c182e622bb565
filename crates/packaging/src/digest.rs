use boxwright_models::{BuildStep, LayerRecord, TreeDigest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

/// Content digests of everything a build reads from its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDigest {
    pub manifest_sha256: String,
    pub trees: Vec<TreeDigest>,
    /// Content digest of the base root filesystem, when the backend can
    /// report one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sha256: Option<String>,
}

pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hash_file_into(&mut hasher, path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_file_into(hasher: &mut Sha256, path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(size)
}

/// Digest over relative paths, entry kinds, permissions, link targets and
/// file contents, walked in name order so it only depends on content.
pub fn tree_digest(root: &Path, destination: &str) -> io::Result<TreeDigest> {
    let mut hasher = Sha256::new();
    let mut files = 0u64;

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let meta = fs::symlink_metadata(entry.path())?;

        if meta.file_type().is_symlink() {
            hasher.update(b"L");
            hasher.update(rel.as_bytes());
            hasher.update([0]);
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
            files += 1;
        } else if meta.is_dir() {
            hasher.update(b"D");
            hasher.update(rel.as_bytes());
            hasher.update([0]);
            hasher.update(mode_bits(&meta).to_le_bytes());
        } else {
            hasher.update(b"F");
            hasher.update(rel.as_bytes());
            hasher.update([0]);
            hasher.update(mode_bits(&meta).to_le_bytes());
            hasher.update(meta.len().to_le_bytes());
            hash_file_into(&mut hasher, entry.path())?;
            files += 1;
        }
        hasher.update([0]);
    }

    Ok(TreeDigest {
        destination: destination.to_string(),
        sha256: format!("{:x}", hasher.finalize()),
        files,
    })
}

/// Chained cache keys: each key covers the previous key, the step itself and
/// the content the step reads. A change to one input therefore changes the
/// key of that step and every later step, never an earlier one.
pub fn layer_chain(steps: &[BuildStep], digest: &ContextDigest) -> Vec<LayerRecord> {
    let mut layers = Vec::with_capacity(steps.len());
    let mut previous = String::new();
    let mut trees = digest.trees.iter();

    for step in steps {
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update([0]);
        hasher.update(step.to_string().as_bytes());
        hasher.update([0]);
        match step {
            BuildStep::Base { .. } => {
                if let Some(base) = &digest.base_sha256 {
                    hasher.update(base.as_bytes());
                }
            }
            BuildStep::CopyManifest { .. } => hasher.update(digest.manifest_sha256.as_bytes()),
            BuildStep::CopyTree(_) => {
                if let Some(tree) = trees.next() {
                    hasher.update(tree.sha256.as_bytes());
                }
            }
            _ => {}
        }
        let key = format!("{:x}", hasher.finalize());
        layers.push(LayerRecord {
            step: step.name().to_string(),
            key: key.clone(),
        });
        previous = key;
    }

    layers
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}
