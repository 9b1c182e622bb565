use crate::BoxError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

/// Base runtime identity, written `name:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
}

impl BaseImage {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

impl FromStr for BaseImage {
    type Err = BoxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BoxError::InvalidImageRef {
            reference: s.to_string(),
        };
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        // A colon before the last '/' belongs to a registry port, not a tag.
        let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match s[last_slash..].rfind(':') {
            Some(i) => (&s[..last_slash + i], &s[last_slash + i + 1..]),
            None => (s, "latest"),
        };

        if name.is_empty() || tag.is_empty() || name.ends_with('/') {
            return Err(invalid());
        }
        Ok(BaseImage::new(name, tag))
    }
}

impl TryFrom<String> for BaseImage {
    type Error = BoxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BaseImage> for String {
    fn from(image: BaseImage) -> Self {
        image.reference()
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// A directory of the build context copied to a subpath of the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyTree {
    pub source: String,
    pub destination: String,
}

impl CopyTree {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub base: BaseImage,
    pub workdir: String,
    pub manifest: String,
    pub install: Vec<String>,
    pub trees: Vec<CopyTree>,
    pub entry: Vec<String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            base: BaseImage::new("python", "3.12-slim"),
            workdir: "/app".to_string(),
            manifest: "requirements.txt".to_string(),
            install: vec![
                "pip".to_string(),
                "install".to_string(),
                "--no-cache-dir".to_string(),
                "-r".to_string(),
                "requirements.txt".to_string(),
            ],
            trees: vec![
                CopyTree::new("src", "src"),
                CopyTree::new("additional-files", "additional-files"),
            ],
            entry: vec!["python".to_string(), "src/main.py".to_string()],
        }
    }
}

impl Recipe {
    pub fn validate(&self) -> Result<(), BoxError> {
        if !self.workdir.starts_with('/') {
            return Err(invalid(format!(
                "working directory must be absolute: {}",
                self.workdir
            )));
        }
        if has_control_chars(&self.workdir) {
            return Err(invalid(format!(
                "working directory must not contain control characters: {:?}",
                self.workdir
            )));
        }
        if has_parent_component(&self.workdir) {
            return Err(invalid(format!(
                "working directory must not contain '..': {}",
                self.workdir
            )));
        }
        if self.install.is_empty() || self.install[0].is_empty() {
            return Err(invalid("install command must not be empty"));
        }
        if self.entry.is_empty() || self.entry[0].is_empty() {
            return Err(invalid("entry command must not be empty"));
        }

        check_relative("manifest", &self.manifest)?;

        let mut destinations = HashSet::new();
        for tree in &self.trees {
            check_relative("tree source", &tree.source)?;
            check_relative("tree destination", &tree.destination)?;
            if !destinations.insert(tree.destination.trim_end_matches('/')) {
                return Err(invalid(format!(
                    "duplicate tree destination: {}",
                    tree.destination
                )));
            }
        }

        Ok(())
    }

    /// The fixed build sequence. Dependencies are installed before any
    /// application tree is copied so that application edits never
    /// invalidate the install layer.
    pub fn steps(&self) -> Vec<BuildStep> {
        let mut steps = vec![
            BuildStep::Base {
                image: self.base.clone(),
            },
            BuildStep::Workdir {
                path: self.workdir.clone(),
            },
            BuildStep::CopyManifest {
                source: self.manifest.clone(),
            },
            BuildStep::InstallDependencies {
                command: self.install.clone(),
            },
        ];
        steps.extend(self.trees.iter().cloned().map(BuildStep::CopyTree));
        steps.push(BuildStep::Entry {
            command: self.entry.clone(),
        });
        steps
    }

    /// Manifest file name as placed in the working directory.
    pub fn manifest_destination(&self) -> &str {
        Path::new(&self.manifest)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    Base { image: BaseImage },
    Workdir { path: String },
    CopyManifest { source: String },
    InstallDependencies { command: Vec<String> },
    CopyTree(CopyTree),
    Entry { command: Vec<String> },
}

impl BuildStep {
    pub fn name(&self) -> &'static str {
        match self {
            BuildStep::Base { .. } => "base",
            BuildStep::Workdir { .. } => "workdir",
            BuildStep::CopyManifest { .. } => "copy-manifest",
            BuildStep::InstallDependencies { .. } => "install-dependencies",
            BuildStep::CopyTree(_) => "copy-tree",
            BuildStep::Entry { .. } => "entry",
        }
    }

    /// Whether the step changes the image filesystem.
    pub fn touches_filesystem(&self) -> bool {
        matches!(
            self,
            BuildStep::Workdir { .. }
                | BuildStep::CopyManifest { .. }
                | BuildStep::InstallDependencies { .. }
                | BuildStep::CopyTree(_)
        )
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStep::Base { image } => write!(f, "base {image}"),
            BuildStep::Workdir { path } => write!(f, "workdir {path}"),
            BuildStep::CopyManifest { source } => write!(f, "copy-manifest {source}"),
            BuildStep::InstallDependencies { command } => {
                write!(f, "install-dependencies {}", command.join(" "))
            }
            BuildStep::CopyTree(tree) => {
                write!(f, "copy-tree {} -> {}", tree.source, tree.destination)
            }
            BuildStep::Entry { command } => write!(f, "entry {}", command.join(" ")),
        }
    }
}

fn invalid(reason: impl Into<String>) -> BoxError {
    BoxError::InvalidRecipe {
        reason: reason.into(),
    }
}

fn has_parent_component(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

fn has_control_chars(path: &str) -> bool {
    path.chars().any(char::is_control)
}

fn check_relative(what: &str, path: &str) -> Result<(), BoxError> {
    if path.is_empty() {
        return Err(invalid(format!("{what} must not be empty")));
    }
    if has_control_chars(path) {
        return Err(invalid(format!(
            "{what} must not contain control characters: {path:?}"
        )));
    }
    if Path::new(path).is_absolute() {
        return Err(invalid(format!("{what} must be relative: {path}")));
    }
    if has_parent_component(path) {
        return Err(invalid(format!("{what} must not contain '..': {path}")));
    }
    if Path::new(path)
        .components()
        .all(|c| matches!(c, Component::CurDir))
    {
        return Err(invalid(format!("{what} must name a path: {path}")));
    }
    Ok(())
}
