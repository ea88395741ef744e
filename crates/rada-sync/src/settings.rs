//! User-adjustable settings persisted next to the process (`app_settings.json`).

use std::path::{Component, Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const DEFAULT_ALBUMS: [&str; 4] = ["SesjeRady", "Archiwum", "Backup", "Dokumenty"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    pub download_base_dir: PathBuf,
    #[serde(default = "default_albums")]
    pub available_albums: Vec<String>,
}

fn default_albums() -> Vec<String> {
    DEFAULT_ALBUMS.iter().map(|s| s.to_string()).collect()
}

impl AppSettings {
    pub fn with_download_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            download_base_dir: dir.into(),
            available_albums: default_albums(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("album name must not be empty")]
    EmptyAlbumName,
    #[error("invalid album name {0:?}")]
    InvalidAlbumName(String),
    #[error("path must not be empty")]
    EmptyPath,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SettingsError {
    /// True for errors caused by the request rather than the filesystem.
    pub fn is_invalid_input(&self) -> bool {
        !matches!(self, SettingsError::Storage(_))
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<AppSettings>,
    write_lock: Mutex<()>,
}

impl SettingsStore {
    /// Reads `path` if present; unreadable files fall back to defaults. Runs
    /// once at startup, before any request is served.
    pub fn load_or_default(path: &Path, default_download_dir: &Path) -> Self {
        let defaults = AppSettings::with_download_dir(default_download_dir);
        let current = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "unreadable settings; using defaults");
                defaults
            }),
            Err(_) => defaults,
        };
        Self {
            path: path.to_path_buf(),
            current: RwLock::new(current),
            write_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> AppSettings {
        self.read().clone()
    }

    pub fn download_dir(&self) -> PathBuf {
        self.read().download_base_dir.clone()
    }

    /// Switches to the sibling folder named `album` of the current directory.
    pub async fn select_album(&self, album: &str) -> Result<PathBuf, SettingsError> {
        let album = validate_album(album)?;
        let _held = self.write_lock.lock().await;
        let current = self.download_dir();
        let parent = current.parent().map(Path::to_path_buf).unwrap_or_default();
        let target = parent.join(album);
        self.set_download_dir(&target).await?;
        Ok(target)
    }

    /// Switches to an arbitrary path; `~` expands to `$HOME`, relative paths
    /// resolve against the working directory.
    pub async fn set_path(&self, raw: &str) -> Result<PathBuf, SettingsError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SettingsError::EmptyPath);
        }
        let expanded = expand_home(raw);
        let absolute = std::path::absolute(&expanded)
            .with_context(|| format!("resolving {}", expanded.display()))?;
        let _held = self.write_lock.lock().await;
        self.set_download_dir(&absolute).await?;
        Ok(absolute)
    }

    pub async fn add_album(&self, album: &str) -> Result<Vec<String>, SettingsError> {
        let album = validate_album(album)?;
        let _held = self.write_lock.lock().await;
        let mut updated = self.current();
        if !updated.available_albums.iter().any(|a| a == album) {
            updated.available_albums.push(album.to_string());
            self.replace(updated.clone()).await?;
        }
        Ok(updated.available_albums)
    }

    /// Caller holds `write_lock`.
    async fn set_download_dir(&self, dir: &Path) -> Result<(), SettingsError> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let mut updated = self.current();
        updated.download_base_dir = dir.to_path_buf();
        self.replace(updated).await?;
        info!(dir = %dir.display(), "download directory changed");
        Ok(())
    }

    async fn replace(&self, settings: AppSettings) -> anyhow::Result<()> {
        let text = serde_json::to_string_pretty(&settings).context("serializing settings")?;
        tokio::fs::write(&self.path, text)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, AppSettings> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_album(album: &str) -> Result<&str, SettingsError> {
    let album = album.trim();
    if album.is_empty() {
        return Err(SettingsError::EmptyAlbumName);
    }
    let mut components = Path::new(album).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(album),
        _ => Err(SettingsError::InvalidAlbumName(album.to_string())),
    }
}

fn expand_home(raw: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    match (raw.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(raw),
    }
}
