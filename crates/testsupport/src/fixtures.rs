use anyhow::Result;
use boxwright_models::{BaseImage, Recipe};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A build context laid out the way the default recipe expects:
/// `requirements.txt`, `src/` and `additional-files/`.
pub struct SampleContext {
    dir: TempDir,
}

impl SampleContext {
    pub fn new() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("ctx-").tempdir()?;
        let ctx = Self { dir };

        ctx.write("requirements.txt", "boto3==1.34.0\npython-dotenv==1.0.1\n")?;
        ctx.write("src/main.py", "import sys\nsys.exit(0)\n")?;
        ctx.write("src/lib/__init__.py", "")?;
        ctx.write("src/lib/helpers.py", "def normalize(p):\n    return p\n")?;
        ctx.write("additional-files/settings.json", "{\"region\": \"eu-west-1\"}\n")?;
        ctx.write_bytes("additional-files/certs/ca.der", &[0x30, 0x82, 0x00, 0xff, 0x00, 0x0a])?;
        fs::create_dir_all(ctx.path().join("additional-files/empty"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            ctx.write("src/run.sh", "#!/bin/sh\nexec python src/main.py\n")?;
            fs::set_permissions(
                ctx.path().join("src/run.sh"),
                fs::Permissions::from_mode(0o755),
            )?;
            std::os::unix::fs::symlink("helpers.py", ctx.path().join("src/lib/alias.py"))?;
        }

        // Outside every copied tree; must never reach an image.
        ctx.write("notes.txt", "not part of the image\n")?;

        Ok(ctx)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        self.write_bytes(rel, contents.as_bytes())
    }

    pub fn write_bytes(&self, rel: &str, contents: &[u8]) -> Result<()> {
        let path = self.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn remove(&self, rel: &str) -> Result<()> {
        let path = self.join(rel);
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Recipe whose install and entry commands are shell scripts, so builds and
/// launches run without a Python toolchain.
pub fn shell_recipe(install_script: &str, entry_script: &str) -> Recipe {
    Recipe {
        base: test_base(),
        install: vec![
            "sh".to_string(),
            "-c".to_string(),
            install_script.to_string(),
        ],
        entry: vec!["sh".to_string(), "-c".to_string(), entry_script.to_string()],
        ..Recipe::default()
    }
}

pub fn test_base() -> BaseImage {
    BaseImage::new("testbase", "1.0")
}

/// A minimal base root filesystem to import into a local store.
pub fn base_rootfs() -> Result<TempDir> {
    let dir = tempfile::Builder::new().prefix("base-").tempdir()?;
    fs::create_dir_all(dir.path().join("etc"))?;
    fs::write(dir.path().join("etc/os-release"), "ID=testbase\nVERSION_ID=1.0\n")?;
    fs::create_dir_all(dir.path().join("usr/local/lib"))?;
    Ok(dir)
}
