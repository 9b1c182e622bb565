use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    Dir { mode: u32 },
    File { contents: Vec<u8>, mode: u32 },
    Symlink { target: PathBuf },
}

/// Every entry below `root`, keyed by relative path.
pub fn tree_snapshot(root: &Path) -> Result<BTreeMap<PathBuf, TreeEntry>> {
    let mut entries = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root)?.to_path_buf();
        let meta = fs::symlink_metadata(entry.path())?;
        let value = if meta.file_type().is_symlink() {
            TreeEntry::Symlink {
                target: fs::read_link(entry.path())?,
            }
        } else if meta.is_dir() {
            TreeEntry::Dir { mode: mode_of(&meta) }
        } else {
            TreeEntry::File {
                contents: fs::read(entry.path())?,
                mode: mode_of(&meta),
            }
        };
        entries.insert(rel, value);
    }
    Ok(entries)
}

/// Fails unless both trees hold the same entries with the same bytes,
/// permissions and link targets.
pub fn assert_same_tree(expected: &Path, actual: &Path) -> Result<()> {
    let left = tree_snapshot(expected)?;
    let right = tree_snapshot(actual)?;

    for (path, entry) in &left {
        match right.get(path) {
            None => bail!("{} missing from {}", path.display(), actual.display()),
            Some(other) if other != entry => bail!("{} differs", path.display()),
            Some(_) => {}
        }
    }
    if let Some(extra) = right.keys().find(|p| !left.contains_key(*p)) {
        bail!("unexpected entry {} in {}", extra.display(), actual.display());
    }
    Ok(())
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    u32::from(meta.permissions().readonly())
}
