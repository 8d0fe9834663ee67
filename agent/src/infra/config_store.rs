//! Infrastructure implementation of the `ConfigStore` port.
//!
//! `JsonConfigStore` keeps the last applied configuration as pretty-printed
//! JSON. Writes go to a temp file that is renamed over the target, so a
//! crash never leaves a half-written document behind.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hive_common::{Configuration, validate_agent_id};

use crate::application::ports::ConfigStore;

/// Default file name inside the working directory.
pub const CONFIG_FILE: &str = "hive.json";

pub struct JsonConfigStore {
    path: PathBuf,
}

impl JsonConfigStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_sync(path: &Path) -> Result<Option<Configuration>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Configuration::from_json(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        validate_agent_id(&config.id)
            .with_context(|| format!("checking agent id in {}", path.display()))?;
        Ok(Some(config))
    }

    fn save_sync(path: &Path, config: &Configuration) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        let content = config.to_json_pretty().context("serializing configuration")?;

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("setting permissions on {}", temp_path.display()))?;
        }

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("finalizing config file {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn load(&self) -> Result<Option<Configuration>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Self::load_sync(&path))
            .await
            .context("config load task panicked")?
    }

    async fn save(&self, config: &Configuration) -> Result<()> {
        let path = self.path.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || Self::save_sync(&path, &config))
            .await
            .context("config save task panicked")?
    }
}
