use std::env::current_exe;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str;
use directories_next::ProjectDirs;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::info;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::config::types::Config;
use crate::error::ConfigError;

const APP_NAME: &str = "presence-beacon";

/// `presence-beacon.json` next to the executable if that file exists (portable installs), otherwise
/// in the OS config directory.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let portable = current_exe().ok().map(|exe| exe.with_extension("json"));
    if let Some(path) = portable.filter(|path| path.is_file()) {
        return Ok(path);
    }

    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().join(format!("{}.json", APP_NAME)))
        .ok_or(ConfigError::NoConfigPath)
}

/// Exclusive lock on the config file. Only one instance may drive the light, so the guard is held
/// for the whole run.
pub struct InstanceLock {
    lock: RwLock<std::fs::File>,
}

impl InstanceLock {
    pub fn acquire(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        self.lock.try_write().map_err(|source| ConfigError::CanNotLock { source })
    }
}

pub struct ConfigFile {
    path: PathBuf,
    file: std::fs::File,
}

impl ConfigFile {
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::open(config_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent() {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(ConfigFile { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn instance_lock(&self) -> Result<InstanceLock, ConfigError> {
        Ok(InstanceLock { lock: RwLock::new(self.file.try_clone()?) })
    }

    // shares the cursor with `self.file`, so every access starts with a rewind
    fn handle(&self) -> Result<File, ConfigError> {
        Ok(File::from_std(self.file.try_clone()?))
    }

    /// An empty (new) file yields `None`.
    pub async fn read(&self) -> Result<Option<Config>, ConfigError> {
        let mut file = self.handle()?;

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.is_empty() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(str::from_utf8(&content)?)?))
    }

    /// Writes the defaults to a new file, so that there is something to edit.
    pub async fn read_or_init(&self) -> Result<Config, ConfigError> {
        if let Some(config) = self.read().await? {
            return Ok(config);
        }

        info!("Config file is empty, writing defaults");
        let config = Config::default();
        self.save(&config).await?;
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.handle()?;

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
