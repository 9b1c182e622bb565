use crate::BaseImage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache key of the filesystem state after one build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub step: String,
    pub key: String,
}

/// Content digest of a tree staged into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDigest {
    pub destination: String,
    pub sha256: String,
    pub files: u64,
}

/// Immutable result of one successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub id: String,
    pub tag: String,
    pub base: BaseImage,
    pub workdir: String,
    pub entry: Vec<String>,
    pub manifest_sha256: String,
    pub layers: Vec<LayerRecord>,
    pub trees: Vec<TreeDigest>,
    pub created_at: DateTime<Utc>,
}

impl ImageArtifact {
    pub fn layer(&self, step: &str) -> Option<&LayerRecord> {
        self.layers.iter().find(|l| l.step == step)
    }

    pub fn tree(&self, destination: &str) -> Option<&TreeDigest> {
        self.trees.iter().find(|t| t.destination == destination)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    pub container_id: String,
    pub exit_code: i64,
}

impl LaunchOutcome {
    /// Exit status for the invoking process. Codes outside 0..=255 cannot be
    /// reported by a process and collapse to 255 so they never read as success.
    pub fn process_exit_code(&self) -> i32 {
        match u8::try_from(self.exit_code) {
            Ok(code) => i32::from(code),
            Err(_) => 255,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_code_passthrough() {
        for code in [0, 1, 137, 255] {
            let outcome = LaunchOutcome {
                container_id: "c".to_string(),
                exit_code: code,
            };
            assert_eq!(outcome.process_exit_code() as i64, code);
        }
    }

    #[test]
    fn test_process_exit_code_out_of_range() {
        for code in [-1, 256, 1 << 40] {
            let outcome = LaunchOutcome {
                container_id: "c".to_string(),
                exit_code: code,
            };
            assert_eq!(outcome.process_exit_code(), 255);
        }
    }
}
