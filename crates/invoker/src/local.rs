use crate::runtime::{ContainerRuntime, CreateSpec};
use anyhow::Context;
use async_trait::async_trait;
use boxwright_models::BoxError;
use boxwright_packaging::fsutil::{blocking, copy_tree};
use boxwright_packaging::LocalStore;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

struct Instance {
    dir: PathBuf,
    spec: CreateSpec,
    child: Option<Child>,
}

/// Runs images from a [`LocalStore`] as host processes. Each container gets
/// its own copy of the image filesystem under `instances/`, and the entry
/// command runs with the image working directory inside that copy as its
/// current directory. There is no isolation beyond that.
pub struct LocalRuntime {
    store: LocalStore,
    instances: Mutex<HashMap<String, Instance>>,
}

impl LocalRuntime {
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            instances: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for LocalRuntime {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create(&self, spec: CreateSpec) -> anyhow::Result<String> {
        let image = self.store.image_rootfs(&spec.image);
        let published = self.store.read_artifact(&spec.image)?;
        let current = published
            .as_ref()
            .is_some_and(|a| spec.image_id.is_empty() || a.id == spec.image_id);
        if !current || !image.is_dir() {
            return Err(BoxError::ImageNotFound {
                tag: spec.image_ref().to_string(),
            }
            .into());
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.store.instances_dir().join(&id);
        {
            let dir = dir.clone();
            blocking(move || {
                if let Err(e) = copy_tree(&image, &dir.join("rootfs")) {
                    let _ = std::fs::remove_dir_all(&dir);
                    return Err(e.into());
                }
                Ok(())
            })
            .await?;
        }

        info!("Created container: {} with ID: {}", spec.name, id);
        self.instances.lock().await.insert(
            id.clone(),
            Instance {
                dir,
                spec,
                child: None,
            },
        );
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start(&self, container_id: &str) -> anyhow::Result<()> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(container_id)
            .with_context(|| format!("no such container: {container_id}"))?;

        let workdir = instance
            .dir
            .join("rootfs")
            .join(instance.spec.working_dir.trim_start_matches('/'));
        let program = resolve_program(instance.spec.program(), &workdir);

        let child = Command::new(&program)
            .args(instance.spec.command.iter().skip(1))
            .current_dir(&workdir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                    anyhow::Error::new(BoxError::EntryNotFound {
                        program: instance.spec.program().to_string(),
                    })
                }
                _ => anyhow::Error::new(e).context(format!("cannot start {}", program.display())),
            })?;

        debug!(pid = child.id(), "Started container: {}", container_id);
        instance.child = Some(child);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn wait(&self, container_id: &str) -> anyhow::Result<i64> {
        // Release the lock while the process runs.
        let child = self
            .instances
            .lock()
            .await
            .get_mut(container_id)
            .and_then(|i| i.child.take());
        let mut child = child.with_context(|| format!("container {container_id} is not running"))?;

        let status = child.wait().await?;
        Ok(exit_code(status))
    }

    #[instrument(skip(self))]
    async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        let Some(mut instance) = self.instances.lock().await.remove(container_id) else {
            return Ok(());
        };
        if let Some(child) = instance.child.as_mut() {
            let _ = child.kill().await;
        }
        let dir = instance.dir;
        blocking(move || {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        })
        .await?;
        debug!("Removed container: {}", container_id);
        Ok(())
    }
}

/// A relative program path with a separator is taken relative to the working
/// directory, as it would be inside the container. Bare names go through `PATH`.
fn resolve_program(program: &str, workdir: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        workdir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Exit code as a container engine reports it: the process code, or
/// 128 + signal number for a process killed by a signal.
fn exit_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    255
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_program() {
        let workdir = Path::new("/store/instances/x/rootfs/app");
        assert_eq!(resolve_program("sh", workdir), PathBuf::from("sh"));
        assert_eq!(
            resolve_program("src/run.sh", workdir),
            workdir.join("src/run.sh")
        );
        assert_eq!(
            resolve_program("./run.sh", workdir),
            workdir.join("./run.sh")
        );
        assert_eq!(resolve_program("/bin/sh", workdir), PathBuf::from("/bin/sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_from_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
    }
}
