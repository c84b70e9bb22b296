//! Settings Overrides
//!
//! Process-wide settings come from defaults, the command line and the
//! config file; the admin surface can temporarily override any of them
//! with a TTL. Readers take an immutable snapshot at operation start;
//! every change swaps in a rebuilt snapshot.
//!
//! A second override for the same setting replaces the previous one and
//! its timer: most recent wins, and an old timer firing late must not
//! clear the newer value. That is what the per-entry generation is for.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::AdminError;
use crate::types::{GetSettingsResponse, SettingInfo, SettingSource};

struct OverrideEntry {
    value: String,
    generation: u64,
}

struct SettingsInner {
    /// Known settings and their defaults. Unknown names are rejected.
    defaults: BTreeMap<String, String>,
    cli: BTreeMap<String, String>,
    config: BTreeMap<String, String>,
    admin_overrides: Mutex<HashMap<String, OverrideEntry>>,
    next_generation: Mutex<u64>,
    /// Snapshot of effective values, swapped on every change.
    snapshot: RwLock<Arc<BTreeMap<String, String>>>,
}

#[derive(Clone)]
pub struct SettingsHandler {
    inner: Arc<SettingsInner>,
}

impl SettingsHandler {
    pub fn new(
        defaults: BTreeMap<String, String>,
        cli: BTreeMap<String, String>,
        config: BTreeMap<String, String>,
    ) -> Self {
        let handler = Self {
            inner: Arc::new(SettingsInner {
                defaults,
                cli,
                config,
                admin_overrides: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                snapshot: RwLock::new(Arc::new(BTreeMap::new())),
            }),
        };
        handler.rebuild_snapshot();
        handler
    }

    /// Current effective values; the returned snapshot is immutable.
    pub fn snapshot(&self) -> Arc<BTreeMap<String, String>> {
        self.inner
            .snapshot
            .read()
            .expect("settings snapshot poisoned")
            .clone()
    }

    pub fn current_value(&self, name: &str) -> Option<String> {
        self.snapshot().get(name).cloned()
    }

    /// Install a temporary override; it expires after `ttl_seconds`.
    /// Must run inside a tokio runtime (the expiry is a spawned timer).
    pub fn apply_setting_override(
        &self,
        name: &str,
        value: &str,
        ttl_seconds: i64,
    ) -> Result<(), AdminError> {
        if ttl_seconds <= 0 {
            return Err(AdminError::InvalidRequest(
                "ttl_seconds must be positive".to_string(),
            ));
        }
        if !self.inner.defaults.contains_key(name) {
            return Err(AdminError::InvalidRequest(format!(
                "unknown setting '{}'",
                name
            )));
        }

        let generation = {
            let mut next = self
                .inner
                .next_generation
                .lock()
                .expect("generation poisoned");
            *next += 1;
            *next
        };
        {
            let mut overrides = self
                .inner
                .admin_overrides
                .lock()
                .expect("overrides poisoned");
            // Replacing an entry also abandons its timer: the old timer
            // sees a newer generation and does nothing.
            overrides.insert(
                name.to_string(),
                OverrideEntry {
                    value: value.to_string(),
                    generation,
                },
            );
        }
        self.rebuild_snapshot();
        info!(setting = name, value, ttl_seconds, "applied setting override");

        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(ttl_seconds as u64)).await;
            this.expire(&name, generation);
        });
        Ok(())
    }

    /// Clear an override now. A no-op for settings without one.
    pub fn remove_setting_override(&self, name: &str) {
        let removed = {
            let mut overrides = self
                .inner
                .admin_overrides
                .lock()
                .expect("overrides poisoned");
            overrides.remove(name).is_some()
        };
        if removed {
            self.rebuild_snapshot();
            info!(setting = name, "removed setting override");
        }
    }

    fn expire(&self, name: &str, generation: u64) {
        let removed = {
            let mut overrides = self
                .inner
                .admin_overrides
                .lock()
                .expect("overrides poisoned");
            match overrides.get(name) {
                Some(entry) if entry.generation == generation => {
                    overrides.remove(name);
                    true
                }
                // A newer override replaced this one; its own timer
                // governs it.
                _ => false,
            }
        };
        if removed {
            self.rebuild_snapshot();
            debug!(setting = name, "setting override expired");
        }
    }

    pub fn get_settings(&self, filter: &[String]) -> GetSettingsResponse {
        let overrides = self
            .inner
            .admin_overrides
            .lock()
            .expect("overrides poisoned");
        let mut settings = BTreeMap::new();
        for (name, default_value) in &self.inner.defaults {
            if !filter.is_empty() && !filter.contains(name) {
                continue;
            }
            let mut sources = BTreeMap::new();
            if let Some(v) = self.inner.cli.get(name) {
                sources.insert(SettingSource::Cli, v.clone());
            }
            if let Some(v) = self.inner.config.get(name) {
                sources.insert(SettingSource::Config, v.clone());
            }
            if let Some(entry) = overrides.get(name) {
                sources.insert(SettingSource::AdminOverride, entry.value.clone());
            }
            let current_value = Self::effective(default_value, &sources);
            settings.insert(
                name.clone(),
                SettingInfo {
                    current_value,
                    default_value: default_value.clone(),
                    sources,
                },
            );
        }
        GetSettingsResponse { settings }
    }

    /// Precedence: admin override, then CLI, then config, then the
    /// default.
    fn effective(default: &str, sources: &BTreeMap<SettingSource, String>) -> String {
        sources
            .get(&SettingSource::AdminOverride)
            .or_else(|| sources.get(&SettingSource::Cli))
            .or_else(|| sources.get(&SettingSource::Config))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn rebuild_snapshot(&self) {
        let overrides = self
            .inner
            .admin_overrides
            .lock()
            .expect("overrides poisoned");
        let mut snapshot = BTreeMap::new();
        for (name, default_value) in &self.inner.defaults {
            let value = overrides
                .get(name)
                .map(|e| e.value.clone())
                .or_else(|| self.inner.cli.get(name).cloned())
                .or_else(|| self.inner.config.get(name).cloned())
                .unwrap_or_else(|| default_value.clone());
            snapshot.insert(name.clone(), value);
        }
        drop(overrides);
        *self
            .inner
            .snapshot
            .write()
            .expect("settings snapshot poisoned") = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> SettingsHandler {
        let defaults = BTreeMap::from([
            ("rebuilding-local-window".to_string(), "60min".to_string()),
            ("append-timeout".to_string(), "15s".to_string()),
        ]);
        let cli = BTreeMap::from([("append-timeout".to_string(), "30s".to_string())]);
        SettingsHandler::new(defaults, cli, BTreeMap::new())
    }

    #[tokio::test]
    async fn test_override_and_ttl_expiry() {
        let h = handler();
        assert_eq!(
            h.current_value("rebuilding-local-window").as_deref(),
            Some("60min")
        );

        h.apply_setting_override("rebuilding-local-window", "30min", 1)
            .expect("override");
        assert_eq!(
            h.current_value("rebuilding-local-window").as_deref(),
            Some("30min")
        );
        let info = h.get_settings(&["rebuilding-local-window".to_string()]);
        let setting = &info.settings["rebuilding-local-window"];
        assert_eq!(setting.current_value, "30min");
        assert_eq!(
            setting.sources.get(&SettingSource::AdminOverride).unwrap(),
            "30min"
        );

        // After the TTL the value reverts.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(
            h.current_value("rebuilding-local-window").as_deref(),
            Some("60min")
        );
    }

    #[tokio::test]
    async fn test_newer_override_survives_old_timer() {
        let h = handler();
        h.apply_setting_override("append-timeout", "1s", 1)
            .expect("first override");
        h.apply_setting_override("append-timeout", "2s", 30)
            .expect("second override");

        // The first override's timer fires but must not clear the
        // newer value.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.current_value("append-timeout").as_deref(), Some("2s"));
    }

    #[tokio::test]
    async fn test_unknown_setting_rejected() {
        let h = handler();
        assert!(matches!(
            h.apply_setting_override("no-such-setting", "x", 5),
            Err(AdminError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.apply_setting_override("append-timeout", "x", 0),
            Err(AdminError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_override_restores_previous_value() {
        let h = handler();
        // CLI gives append-timeout 30s; override wins; removal reverts
        // to the CLI value, not the default.
        assert_eq!(h.current_value("append-timeout").as_deref(), Some("30s"));
        h.apply_setting_override("append-timeout", "5s", 60)
            .expect("override");
        assert_eq!(h.current_value("append-timeout").as_deref(), Some("5s"));

        h.remove_setting_override("append-timeout");
        assert_eq!(h.current_value("append-timeout").as_deref(), Some("30s"));

        // Removing again is a no-op.
        h.remove_setting_override("append-timeout");
    }
}
