use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoxError {
    #[error("Invalid recipe: {reason}")]
    InvalidRecipe { reason: String },

    #[error("Invalid image reference: {reference}")]
    InvalidImageRef { reference: String },

    #[error("Build context not found: {path}")]
    ContextNotFound { path: String },

    #[error("Step {step} failed: input missing: {path}")]
    MissingInput { step: String, path: String },

    #[error("Step {step} failed: input unreadable: {path}: {reason}")]
    UnreadableInput {
        step: String,
        path: String,
        reason: String,
    },

    #[error("Base image not found: {image}")]
    BaseImageNotFound { image: String },

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Image not found: {tag}")]
    ImageNotFound { tag: String },

    #[error("Docker error: {message}")]
    DockerError { message: String },

    #[error("Entry command not found: {program}")]
    EntryNotFound { program: String },

    #[error("Launch failed: {reason}")]
    LaunchError { reason: String },

    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    #[error("Internal error: {reason}")]
    InternalError { reason: String },
}

impl BoxError {
    pub fn error_type(&self) -> &'static str {
        match self {
            BoxError::InvalidRecipe { .. } => "InvalidRecipe",
            BoxError::InvalidImageRef { .. } => "InvalidRecipe",
            BoxError::ContextNotFound { .. } => "BuildInputError",
            BoxError::MissingInput { .. } => "BuildInputError",
            BoxError::UnreadableInput { .. } => "BuildInputError",
            BoxError::BaseImageNotFound { .. } => "BuildInputError",
            BoxError::StepFailed { .. } => "BuildStepError",
            BoxError::ImageNotFound { .. } => "ImageNotFound",
            BoxError::DockerError { .. } => "EngineError",
            BoxError::EntryNotFound { .. } => "LaunchError",
            BoxError::LaunchError { .. } => "LaunchError",
            BoxError::ConfigError { .. } => "ConfigError",
            BoxError::InternalError { .. } => "EngineError",
        }
    }

    /// Exit status the CLI reports when Boxwright itself fails. Follows the
    /// convention container CLIs use: 125 for engine-side launch failures,
    /// 127 when the entry program does not exist.
    pub fn cli_exit_code(&self) -> i32 {
        match self {
            BoxError::EntryNotFound { .. } => 127,
            BoxError::LaunchError { .. } => 125,
            _ => 1,
        }
    }

    /// Name of the build step an error is attributed to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            BoxError::MissingInput { step, .. }
            | BoxError::UnreadableInput { step, .. }
            | BoxError::StepFailed { step, .. } => Some(step),
            BoxError::BaseImageNotFound { .. } => Some("base"),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BoxError {
    fn from(e: std::io::Error) -> Self {
        BoxError::InternalError {
            reason: e.to_string(),
        }
    }
}

impl From<figment::Error> for BoxError {
    fn from(e: figment::Error) -> Self {
        BoxError::ConfigError {
            reason: e.to_string(),
        }
    }
}
