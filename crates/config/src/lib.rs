//! Layered configuration for the `lode` command.
//!
//! Sources, later ones overriding earlier ones:
//!
//! 1. built-in defaults,
//! 2. `config.toml` then `config.yaml` in the user's configuration directory,
//! 3. a file given explicitly (TOML, YAML or JSON, by extension),
//! 4. `LODE_*` environment variables (`LODE_INDEX`, `LODE_READ_ONLY`,
//!    `LODE_CACHE_SIZE`, `LODE_LOG`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_PREFIX: &str = "LODE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Index file to open.
    pub index: PathBuf,
    /// Open the index without writing to it.
    pub read_only: bool,
    /// Parsed archives kept open by each archive mine kind.
    pub cache_size: usize,
    /// Log filter, in `tracing_subscriber::EnvFilter` syntax.
    pub log: String,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            index: PathBuf::from("lode.db"),
            read_only: false,
            cache_size: 16,
            log: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from every source.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let user = ProjectDirs::from("", "", "lode").map(|dirs| dirs.config_dir().to_path_buf());
        Self::load_from(user.as_deref(), explicit)
    }

    /// Load with `user` as the user configuration directory.
    pub fn load_from(user: Option<&Path>, explicit: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dir) = user {
            figment = figment
                .merge(Toml::file(dir.join("config.toml")))
                .merge(Yaml::file(dir.join("config.yaml")));
        }
        if let Some(path) = explicit {
            if !path.is_file() {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
            }
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_lowercase)
                .unwrap_or_default();
            figment = match extension.as_str() {
                "toml" => figment.merge(Toml::file(path)),
                "yaml" | "yml" => figment.merge(Yaml::file(path)),
                "json" => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.display().to_string())),
            };
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).only(&["index", "read_only", "cache_size", "log"]))
            .extract()
            .or_raise(|| ErrorKind::Parse)?;
        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_size == 0 {
            exn::bail!(ErrorKind::Invalid("cache_size must be at least 1"));
        }
        if self.index.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("index must not be empty"));
        }
        Ok(())
    }
}
