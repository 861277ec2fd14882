use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::request::BackendId;

/// Connection settings for one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub base_url: String,
    pub api_key: String,
    /// Overall budget: HTTP timeout for synchronous backends, poll budget for
    /// submit-then-poll backends.
    pub timeout_secs: f64,
    /// Engine or checkpoint name; empty means the backend's default.
    pub model: String,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

impl BackendSettings {
    pub fn defaults_for(backend: BackendId) -> Self {
        let (base_url, timeout_secs, model) = match backend {
            BackendId::Stability => ("https://api.stability.ai", 60.0, "stable-diffusion-v1-6"),
            BackendId::Automatic1111 => ("http://127.0.0.1:7860", 300.0, ""),
            BackendId::StableHorde => ("https://stablehorde.net", 180.0, ""),
        };
        Self {
            base_url: base_url.to_string(),
            api_key: String::new(),
            timeout_secs,
            model: model.to_string(),
        }
    }

    /// Base URL without trailing slashes.
    pub fn api_base(&self) -> &str {
        self.base_url.trim().trim_end_matches('/')
    }

    /// Non-positive, non-finite or unrepresentable values fall back to 60 s.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn api_key(&self) -> Option<&str> {
        Some(self.api_key.trim()).filter(|value| !value.is_empty())
    }

    pub fn model(&self) -> Option<&str> {
        Some(self.model.trim()).filter(|value| !value.is_empty())
    }

    fn merge_missing(&mut self, defaults: &BackendSettings) {
        if self.base_url.trim().is_empty() {
            self.base_url = defaults.base_url.clone();
        }
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            self.timeout_secs = defaults.timeout_secs;
        }
        if self.model.trim().is_empty() {
            self.model = defaults.model.clone();
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: 0.0,
            model: String::new(),
        }
    }
}

/// Host preferences consumed read-only by the dispatch layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Selected backend identifier, kept raw so that an unknown value can be
    /// surfaced as a configuration error at dispatch time.
    pub backend: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub backends: BTreeMap<String, BackendSettings>,
}

impl Settings {
    /// Reads a JSON settings file, then applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading settings {}", path.display()))?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing settings {}", path.display()))?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Settings from the environment alone.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        settings.apply_env_overrides();
        settings
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(backend) = non_empty_env("DREAMDECK_BACKEND") {
            self.backend = Some(backend);
        }
        if let Some(dir) = non_empty_env("DREAMDECK_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(dir));
        }
        let overrides = [
            (BackendId::Stability, "STABILITY_API_BASE", "STABILITY_API_KEY"),
            (BackendId::Automatic1111, "A1111_API_BASE", "A1111_API_KEY"),
            (BackendId::StableHorde, "STABLE_HORDE_API_BASE", "STABLE_HORDE_API_KEY"),
        ];
        for (backend, base_var, key_var) in overrides {
            let base = non_empty_env(base_var);
            let key = non_empty_env(key_var);
            if base.is_none() && key.is_none() {
                continue;
            }
            let entry = self
                .backends
                .entry(backend.as_str().to_string())
                .or_default();
            if let Some(base) = base {
                entry.base_url = base;
            }
            if let Some(key) = key {
                entry.api_key = key;
            }
        }
    }

    /// Effective settings for a backend, with defaults filled in.
    pub fn backend_settings(&self, backend: BackendId) -> BackendSettings {
        let defaults = BackendSettings::defaults_for(backend);
        let mut resolved = self
            .backends
            .get(backend.as_str())
            .cloned()
            .unwrap_or_else(|| defaults.clone());
        resolved.merge_missing(&defaults);
        resolved
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(env::temp_dir)
    }

    pub fn selected_backend(&self) -> Option<&str> {
        self.backend
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::{BackendSettings, Settings};
    use crate::request::BackendId;

    #[test]
    fn unusable_timeouts_fall_back_to_default() {
        let mut settings = BackendSettings::defaults_for(BackendId::StableHorde);
        for raw in [1e30, f64::MAX, f64::INFINITY, f64::NAN, 0.0, -5.0, 1e-12] {
            settings.timeout_secs = raw;
            assert_eq!(settings.timeout(), Duration::from_secs(60), "{raw}");
        }
        settings.timeout_secs = 2.5;
        assert_eq!(settings.timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn huge_timeout_in_settings_file_loads_without_panicking() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");
        fs::write(
            &path,
            r#"{ "backends": { "stablehorde": { "timeout_secs": 1e30 } } }"#,
        )?;
        let settings = Settings::load(&path)?;
        let horde = settings.backend_settings(BackendId::StableHorde);
        assert_eq!(horde.timeout(), Duration::from_secs(60));
        Ok(())
    }

    #[test]
    fn load_fills_missing_fields_with_backend_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");
        fs::write(
            &path,
            r#"{
                "backend": "automatic1111",
                "backends": {
                    "automatic1111": { "base_url": "http://gpu-box:7860/" },
                    "stability": { "api_key": "sk-test", "timeout_secs": 12 }
                }
            }"#,
        )?;
        let settings = Settings::load(&path)?;
        assert_eq!(settings.selected_backend(), Some("automatic1111"));

        let a1111 = settings.backend_settings(BackendId::Automatic1111);
        assert_eq!(a1111.api_base(), "http://gpu-box:7860");
        assert_eq!(a1111.timeout_secs, 300.0);

        let stability = settings.backend_settings(BackendId::Stability);
        assert_eq!(stability.api_key(), Some("sk-test"));
        assert_eq!(stability.timeout_secs, 12.0);
        assert_eq!(stability.model(), Some("stable-diffusion-v1-6"));
        Ok(())
    }

    #[test]
    fn unconfigured_backend_uses_defaults() {
        let settings = Settings::default();
        assert_eq!(
            settings.backend_settings(BackendId::StableHorde),
            BackendSettings::defaults_for(BackendId::StableHorde)
        );
        assert_eq!(settings.selected_backend(), None);
    }

    #[test]
    fn load_reports_malformed_json() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("settings.json");
        fs::write(&path, "{ not json")?;
        let err = Settings::load(&path).expect_err("malformed settings");
        assert!(format!("{err:#}").contains("failed parsing settings"));
        Ok(())
    }
}
