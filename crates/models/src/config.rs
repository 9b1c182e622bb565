use crate::{BoxError, Recipe};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PREFIX: &str = "BOXWRIGHT_";

/// Top-level sections environment variables may set. Other `BOXWRIGHT_*`
/// variables belong to build and launch processes and are ignored here.
const ENV_SECTIONS: [&str; 4] = ["engine", "store", "recipe", "logging"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub recipe: Recipe,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Docker,
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Docker endpoint; empty means `DOCKER_HOST` or the local socket.
    pub docker_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Root of the local engine's artifact store.
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: ".boxwright".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file when given, then `BOXWRIGHT_*` variables
    /// (`__` separates nested keys).
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(
            Env::prefixed(ENV_PREFIX)
                .filter(|key| is_config_key(key.as_str()))
                .split("__"),
        )
    }

    pub fn load(path: Option<&Path>) -> Result<Self, BoxError> {
        if let Some(path) = path {
            if !path.is_file() {
                return Err(BoxError::ConfigError {
                    reason: format!("config file not found: {}", path.display()),
                });
            }
        }
        let config: Config = Self::figment(path).extract()?;
        config
            .recipe
            .validate()
            .map_err(|e| BoxError::ConfigError {
                reason: e.to_string(),
            })?;
        Ok(config)
    }
}

fn is_config_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ENV_SECTIONS.iter().any(|section| {
        key.strip_prefix(section)
            .is_some_and(|rest| rest.starts_with("__") || rest.starts_with('.'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BaseImage;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();
            assert_eq!(config.engine.kind, EngineKind::Docker);
            assert_eq!(config.store.dir, ".boxwright");
            assert_eq!(config.recipe, Recipe::default());
            assert!(!config.logging.json);
            Ok(())
        });
    }

    #[test]
    fn test_toml_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "boxwright.toml",
                r#"
                [engine]
                kind = "local"

                [recipe]
                base = "python:3.11-alpine"
                workdir = "/srv"
                "#,
            )?;
            jail.set_env("BOXWRIGHT_LOGGING__JSON", "true");
            jail.set_env("BOXWRIGHT_STORE__DIR", "/var/lib/boxwright");

            let config = Config::load(Some(Path::new("boxwright.toml"))).unwrap();
            assert_eq!(config.engine.kind, EngineKind::Local);
            assert_eq!(config.recipe.base, BaseImage::new("python", "3.11-alpine"));
            assert_eq!(config.recipe.workdir, "/srv");
            assert_eq!(config.recipe.manifest, "requirements.txt");
            assert!(config.logging.json);
            assert_eq!(config.store.dir, "/var/lib/boxwright");
            Ok(())
        });
    }

    #[test]
    fn test_unrelated_env_vars_ignored() {
        Jail::expect_with(|jail| {
            jail.set_env("BOXWRIGHT_ROOTFS", "/tmp/build/rootfs");
            jail.set_env("BOXWRIGHT_ENGINEERING", "yes");
            jail.set_env("BOXWRIGHT_ENGINE__KIND", "local");

            let config = Config::load(None).unwrap();
            assert_eq!(config.engine.kind, EngineKind::Local);
            Ok(())
        });
    }

    #[test]
    fn test_unknown_nested_env_key_rejected() {
        Jail::expect_with(|jail| {
            jail.set_env("BOXWRIGHT_ENGINE__FLAVOUR", "podman");
            let result = Config::load(None);
            assert!(matches!(result, Err(BoxError::ConfigError { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_is_config_key() {
        assert!(is_config_key("engine__kind"));
        assert!(is_config_key("LOGGING.json"));
        assert!(!is_config_key("rootfs"));
        assert!(!is_config_key("engineering"));
        assert!(!is_config_key("store"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("boxwright.toml", "[engine]\nflavour = \"podman\"\n")?;
            let result = Config::load(Some(Path::new("boxwright.toml")));
            assert!(matches!(result, Err(BoxError::ConfigError { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_invalid_recipe_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("boxwright.toml", "[recipe]\nworkdir = \"relative\"\n")?;
            let result = Config::load(Some(Path::new("boxwright.toml")));
            assert!(matches!(result, Err(BoxError::ConfigError { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        Jail::expect_with(|_jail| {
            let result = Config::load(Some(Path::new("nope.toml")));
            assert!(matches!(result, Err(BoxError::ConfigError { .. })));
            Ok(())
        });
    }
}
