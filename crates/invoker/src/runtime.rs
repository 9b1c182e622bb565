use async_trait::async_trait;
use boxwright_models::ImageArtifact;

/// What to create a container from. The command and working directory are
/// taken from the artifact unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateSpec {
    pub image: String,
    /// Content id of the built image. Pins the launch to that build even if
    /// the tag has since moved.
    pub image_id: String,
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub labels: Vec<(String, String)>,
}

impl CreateSpec {
    pub fn for_artifact(artifact: &ImageArtifact) -> Self {
        Self {
            image: artifact.tag.clone(),
            image_id: artifact.id.clone(),
            name: container_name(&artifact.tag),
            command: artifact.entry.clone(),
            working_dir: artifact.workdir.clone(),
            labels: vec![("boxwright.image".to_string(), artifact.tag.clone())],
        }
    }

    /// Reference an engine should create the container from: the image id
    /// when known, the tag otherwise.
    pub fn image_ref(&self) -> &str {
        if self.image_id.is_empty() {
            &self.image
        } else {
            &self.image_id
        }
    }

    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

/// `boxwright-<image name>-<uuid>`, limited to characters container names allow.
fn container_name(tag: &str) -> String {
    let name = tag
        .rsplit('/')
        .next()
        .and_then(|n| n.split(':').next())
        .unwrap_or("app");
    let name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("boxwright-{}-{}", name, uuid::Uuid::new_v4().simple())
}

/// Container lifecycle primitives. Errors that should reach the user with a
/// specific classification carry a `BoxError` inside the `anyhow::Error`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn create(&self, spec: CreateSpec) -> anyhow::Result<String>; // returns container_id
    async fn start(&self, container_id: &str) -> anyhow::Result<()>;
    /// Blocks until the container exits and returns its exit code.
    async fn wait(&self, container_id: &str) -> anyhow::Result<i64>;
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
}
