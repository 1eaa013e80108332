//! `user_settings.json`: software-side preferences that persist between
//! sessions but are never written to the hardware (unlike max travel and
//! backlash, which live in the Robofocus itself).

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::FocuserCfg;

/// Which transport backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Hardware,
    Simulator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Last successfully connected serial port.
    pub last_port: Option<String>,
    /// Soft per-move cap, in steps.
    pub max_increment: u32,
    /// Soft minimum raw position.
    pub min_step: u32,
    /// Raw position corresponding to logical zero; subtracted from every
    /// reported position and added to every requested one.
    pub zero_offset: i32,
    /// Mode preference; `None` defers to the configuration file.
    pub mode: Option<Mode>,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            last_port: None,
            max_increment: 60_000,
            min_step: 0,
            zero_offset: 0,
            mode: None,
        }
    }
}

impl UserSettings {
    fn seeded_from(focuser: &FocuserCfg) -> Self {
        Self {
            max_increment: focuser.max_increment,
            min_step: focuser.min_step,
            ..Self::default()
        }
    }
}

/// Write-through store for [`UserSettings`]. Reads are cheap snapshots;
/// every update is persisted immediately (persist failures are logged, not
/// propagated, so a read-only disk does not break focusing).
#[derive(Debug)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    data: Mutex<UserSettings>,
}

impl SettingsStore {
    pub fn load_or_create(path: PathBuf, focuser: &FocuserCfg) -> anyhow::Result<Self> {
        let data = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid user settings {}", path.display()))?
        } else {
            let defaults = UserSettings::seeded_from(focuser);
            let text = serde_json::to_string_pretty(&defaults)?;
            std::fs::write(&path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "created default user settings");
            defaults
        };
        Ok(Self {
            path: Some(path),
            data: Mutex::new(data),
        })
    }

    /// A store that never touches disk; used by tests and one-off runs.
    pub fn in_memory(data: UserSettings) -> Self {
        Self {
            path: None,
            data: Mutex::new(data),
        }
    }

    pub fn get(&self) -> UserSettings {
        self.data.lock().clone()
    }

    pub fn update(&self, apply: impl FnOnce(&mut UserSettings)) {
        let snapshot = {
            let mut data = self.data.lock();
            apply(&mut data);
            data.clone()
        };
        if let Some(path) = &self.path {
            let result = serde_json::to_string_pretty(&snapshot)
                .map_err(anyhow::Error::from)
                .and_then(|text| std::fs::write(path, text).map_err(Into::into));
            if let Err(err) = result {
                tracing::error!(%err, path = %path.display(), "failed to persist user settings");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_visible_to_later_reads() {
        let store = SettingsStore::in_memory(UserSettings::default());
        store.update(|s| s.zero_offset = 1200);
        store.update(|s| s.mode = Some(Mode::Simulator));
        let snapshot = store.get();
        assert_eq!(snapshot.zero_offset, 1200);
        assert_eq!(snapshot.mode, Some(Mode::Simulator));
    }

    #[test]
    fn settings_survive_a_store_reload() {
        let path = std::env::temp_dir().join(format!(
            "robofocus-settings-{}-{:?}.json",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_file(&path);

        let focuser = FocuserCfg::default();
        let store = SettingsStore::load_or_create(path.clone(), &focuser).expect("create");
        store.update(|s| {
            s.last_port = Some("COM7".to_owned());
            s.max_increment = 5000;
        });
        drop(store);

        let store = SettingsStore::load_or_create(path.clone(), &focuser).expect("reload");
        let snapshot = store.get();
        assert_eq!(snapshot.last_port.as_deref(), Some("COM7"));
        assert_eq!(snapshot.max_increment, 5000);

        let _ = std::fs::remove_file(&path);
    }
}
