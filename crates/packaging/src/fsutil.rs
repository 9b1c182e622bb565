use boxwright_models::BoxError;
use std::fs;
use std::io;
use std::path::Path;

/// Recursively copy `src` into `dst`, keeping file bytes, permissions and
/// symlinks (links are recreated, never followed). Returns the number of
/// non-directory entries copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a directory: {}", src.display()),
        ));
    }
    fs::create_dir_all(dst)?;

    let mut copied = 0u64;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if fs::symlink_metadata(&to).is_ok() {
                fs::remove_file(&to)?;
            }
            symlink(&target, &to)?;
            copied += 1;
        } else if file_type.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
            copied += 1;
        }
    }

    // Last, so a read-only source directory does not block its own children.
    fs::set_permissions(dst, meta.permissions())?;
    Ok(copied)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot recreate symlink {} -> {}", link.display(), target.display()),
    ))
}

/// Move `src` to `dst`, replacing whatever `dst` held. `retired` is a scratch
/// path on the same filesystem that the old `dst` passes through.
pub fn replace_dir(src: &Path, dst: &Path, retired: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let had_old = dst.exists();
    if had_old {
        fs::rename(dst, retired)?;
    }
    if let Err(e) = fs::rename(src, dst) {
        if had_old {
            // Put the previous content back so a failed publish changes nothing.
            let _ = fs::rename(retired, dst);
        }
        return Err(e);
    }
    if had_old {
        fs::remove_dir_all(retired)?;
    }
    Ok(())
}

/// Run blocking filesystem work off the async executor.
pub async fn blocking<T, F>(f: F) -> Result<T, BoxError>
where
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BoxError::InternalError {
            reason: format!("blocking task failed: {e}"),
        })?
}
