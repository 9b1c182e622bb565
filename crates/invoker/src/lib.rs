pub mod docker;
pub mod launcher;
pub mod local;
pub mod runtime;

pub use docker::*;
pub use launcher::*;
pub use local::*;
pub use runtime::*;

#[cfg(test)]
mod tests {
    use super::*;
    use boxwright_models::{BaseImage, ImageArtifact};

    fn artifact(tag: &str) -> ImageArtifact {
        ImageArtifact {
            id: "sha256:abc".to_string(),
            tag: tag.to_string(),
            base: BaseImage::new("python", "3.12-slim"),
            workdir: "/app".to_string(),
            entry: vec!["python".to_string(), "src/main.py".to_string()],
            manifest_sha256: "m".to_string(),
            layers: vec![],
            trees: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_spec_mirrors_artifact() {
        let spec = CreateSpec::for_artifact(&artifact("boxwright/purge-job:latest"));
        assert_eq!(spec.image, "boxwright/purge-job:latest");
        assert_eq!(spec.image_id, "sha256:abc");
        assert_eq!(spec.image_ref(), "sha256:abc");
        assert_eq!(spec.command, vec!["python", "src/main.py"]);
        assert_eq!(spec.working_dir, "/app");
        assert_eq!(spec.program(), "python");
    }

    #[test]
    fn test_image_ref_falls_back_to_tag() {
        let mut unbuilt = artifact("boxwright/purge-job:latest");
        unbuilt.id.clear();
        let spec = CreateSpec::for_artifact(&unbuilt);
        assert_eq!(spec.image_ref(), "boxwright/purge-job:latest");
    }

    #[test]
    fn test_container_names_are_unique_and_valid() {
        let a = CreateSpec::for_artifact(&artifact("registry.local:5000/team/purge_job:1.0"));
        let b = CreateSpec::for_artifact(&artifact("registry.local:5000/team/purge_job:1.0"));
        assert_ne!(a.name, b.name);
        assert!(a.name.starts_with("boxwright-purge-job-"));
        assert!(a
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }
}
