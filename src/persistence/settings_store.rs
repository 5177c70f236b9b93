use super::BridgeSettings;
use crate::calibration::CalibrationProfile;
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{create_dir_all, read_to_string, rename, try_exists, write};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/gc-bridge";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Settings file IO failed for {0}: {1}")]
    Io(PathBuf, String),
    #[error("Settings file {0} is not valid: {1}")]
    Parse(PathBuf, String),
    #[error("Failed to serialize settings: {0}")]
    Serialize(String),
}

/// Owns the settings file and the in-memory copy every slot reads from.
#[derive(Debug)]
pub struct SettingsStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    settings: RwLock<BridgeSettings>,
}

impl SettingsStore {
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(SETTINGS_FILE);
        path
    }

    /// Store that writes to `path` on every update.
    pub fn new(path: impl Into<PathBuf>, settings: BridgeSettings) -> Self {
        Self {
            path: Some(path.into()),
            settings: RwLock::new(settings),
        }
    }

    pub fn in_memory(settings: BridgeSettings) -> Self {
        Self {
            path: None,
            settings: RwLock::new(settings),
        }
    }

    /// Loads the file at `path`. A missing or unreadable file yields defaults.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match read_settings(&path).await {
            Ok(Some(settings)) => {
                info!("Loaded settings from {}", path.display());
                settings
            }
            Ok(None) => {
                info!("No settings at {}, using defaults", path.display());
                BridgeSettings::default()
            }
            Err(e) => {
                warn!("{}; using defaults", e);
                BridgeSettings::default()
            }
        };
        Self::new(path, settings)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn snapshot(&self) -> BridgeSettings {
        self.settings.read().await.clone()
    }

    /// Applies `change` and writes the result to disk.
    pub async fn update<F>(&self, change: F) -> Result<(), SettingsError>
    where
        F: FnOnce(&mut BridgeSettings),
    {
        let contents = {
            let mut guard = self.settings.write().await;
            change(&mut guard);
            guard.saved_at = Some(Utc::now());
            toml::to_string_pretty(&*guard).map_err(|e| SettingsError::Serialize(e.to_string()))?
        };
        self.write_file(contents).await
    }

    pub async fn save(&self) -> Result<(), SettingsError> {
        self.update(|_| {}).await
    }

    pub async fn save_profile(
        &self,
        device_key: &str,
        profile: CalibrationProfile,
    ) -> Result<(), SettingsError> {
        debug!("Saving calibration for {}", device_key);
        self.update(|settings| settings.set_profile(device_key, profile))
            .await
    }

    async fn write_file(&self, contents: String) -> Result<(), SettingsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |e: std::io::Error| SettingsError::Io(path.clone(), e.to_string());

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !try_exists(dir).await.map_err(io_err)? {
                create_dir_all(dir).await.map_err(io_err)?;
            }
        }

        let tmp = path.with_extension("toml.tmp");
        write(&tmp, contents).await.map_err(io_err)?;
        rename(&tmp, path).await.map_err(io_err)?;
        debug!("Settings written to {}", path.display());
        Ok(())
    }
}

async fn read_settings(path: &Path) -> Result<Option<BridgeSettings>, SettingsError> {
    let exists = try_exists(path)
        .await
        .map_err(|e| SettingsError::Io(path.to_path_buf(), e.to_string()))?;
    if !exists {
        return Ok(None);
    }
    let contents = read_to_string(path)
        .await
        .map_err(|e| SettingsError::Io(path.to_path_buf(), e.to_string()))?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|e| SettingsError::Parse(path.to_path_buf(), e.to_string()))
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BdAddr;
    use crate::calibration::Octagon;
    use crate::emulation::BackendKind;
    use crate::persistence::ConnectionMode;

    #[tokio::test]
    async fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let store = SettingsStore::load(&path).await;
        let mut profile = CalibrationProfile::default();
        profile.left_stick.x.center = 2050.0;
        profile.left_stick.x.range = 1950.0;
        profile.right_stick.octagon = Some(Octagon::regular());
        store
            .update(|s| {
                s.auto_connect = true;
                s.emulation_mode = BackendKind::Xbox360;
                let slot = s.slot_mut(1);
                slot.connection_mode = ConnectionMode::Ble;
                slot.preferred_ble_address = Some("98:B6:E9:01:02:03".parse().unwrap());
            })
            .await
            .unwrap();
        store.save_profile("98:B6:E9:01:02:03", profile).await.unwrap();

        let reloaded = SettingsStore::load(&path).await.snapshot().await;
        assert!(reloaded.auto_connect);
        assert_eq!(reloaded.emulation_mode, BackendKind::Xbox360);
        assert_eq!(reloaded.slot(1).connection_mode, ConnectionMode::Ble);
        assert_eq!(
            reloaded.slot(1).preferred_ble_address,
            Some(BdAddr([0x98, 0xB6, 0xE9, 0x01, 0x02, 0x03]))
        );
        assert_eq!(reloaded.profiles["98:B6:E9:01:02:03"], profile);
        assert!(reloaded.saved_at.is_some());
    }

    #[tokio::test]
    async fn corrupt_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        tokio::fs::write(&path, "auto_connect = [not toml").await.unwrap();

        let store = SettingsStore::load(&path).await;
        assert_eq!(store.snapshot().await, BridgeSettings::default());
        assert!(matches!(
            read_settings(&path).await,
            Err(SettingsError::Parse(_, _))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(read_settings(&path).await.unwrap().is_none());
        assert_eq!(SettingsStore::load(&path).await.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn in_memory_store_keeps_updates() {
        let store = SettingsStore::in_memory(BridgeSettings::default());
        store.update(|s| s.auto_connect = true).await.unwrap();
        assert!(store.snapshot().await.auto_connect);
        assert!(store.path().is_none());
    }
}
