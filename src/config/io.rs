use std::env::current_exe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use directories_next::ProjectDirs;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use serde_json;
use fd_lock::{RwLock, RwLockWriteGuard};
use log::{debug, info};
use std::fs::OpenOptions;
use std::str;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to <exe name>.json in the same directory as the executable
// so that a copy on a usb stick carries its own lighthouse list
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            if !path.set_extension("json") {
                debug!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            debug!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to lighthouse-power.json in an os dependent standard directory, such as
// ~/.config/lighthouse-power on linux.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "lighthouse-power").map(|dirs| {
        dirs.config_dir().join("lighthouse-power.json")
    })
}

fn get_config_path(explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    if let Some(path) = get_portable_config_path() {
        match std::fs::metadata(&path) {
            Ok(attr) if attr.is_file() => return Ok(path),
            Ok(_) => {},
            Err(err) => {
                debug!("Could not read metadata of: {}; Using local path instead. ({:?})", path.to_string_lossy(), err);
            },
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

/// Holds the exclusive lock on the config file. Only one process may drive the
/// lighthouses at a time since every device accepts a single client.
pub struct ConfigIOLocker {
    rw_lock: RwLock<std::fs::File>,
}

impl ConfigIOLocker {
    pub fn lock(&mut self) -> Result<RwLockWriteGuard<'_, std::fs::File>, ConfigError> {
        match self.rw_lock.try_write() {
            Ok(guard) => Ok(guard),
            Err(source) => Err(ConfigError::CanNotLock { source }),
        }
    }
}

struct ConfigIOInner {
    file: std::fs::File,
}

#[derive(Clone)]
pub struct ConfigIO {
    path: PathBuf,
    inner: Arc<Mutex<ConfigIOInner>>,
}

impl ConfigIO {
    pub fn open(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = get_config_path(explicit)?;
        info!("Using config file {}", path.to_string_lossy());

        if let Some(directory) = path.parent().filter(|directory| !directory.as_os_str().is_empty()) {
            std::fs::create_dir_all(directory)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .truncate(false)
            .append(false)
            .create(true)
            .open(&path)?;

        let inner = ConfigIOInner {
            file,
        };
        Ok(ConfigIO { path, inner: Arc::new(Mutex::new(inner)) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn locker(&mut self) -> Result<ConfigIOLocker, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");

        Ok(ConfigIOLocker {
            rw_lock: RwLock::new(inner.file.try_clone()?),
        })
    }

    // The File returned from here should never be closed!
    fn get_file(&self) -> Result<File, ConfigError> {
        let inner = self.inner.lock().expect("Failed to lock ConfigIO inner");
        let file = inner.file.try_clone()?; // std File
        Ok(File::from_std(file)) // tokio File
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let mut file = self.get_file()?;
        debug!("Reading config file");

        let mut content = vec![];
        file.rewind().await?;
        file.read_to_end(&mut content).await?;

        if content.iter().all(|byte| byte.is_ascii_whitespace()) {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;

        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let mut file = self.get_file()?;
        info!("Saving config to {}", self.path.to_string_lossy());

        let content = serde_json::to_string_pretty(config)?;
        file.rewind().await?;
        file.set_len(0).await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
