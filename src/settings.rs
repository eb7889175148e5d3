use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_DETECTION_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_RESTORATION_MODEL: &str = "gemini-2.5-flash-image";

const API_KEY_VARS: [&str; 3] = ["API_KEY", "GEMINI_API_KEY", "GOOGLE_API_KEY"];
const MASK_MIN_KEY_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid settings {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write settings: {0}")]
    Write(#[from] io::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_base: String,
    pub detection_model: String,
    pub restoration_model: String,
    /// Maximum restoration calls in flight per record.
    pub restore_concurrency: usize,
    /// Deadline for every external call.
    pub request_timeout_secs: u64,
    /// Share of each crop edge trimmed away.
    pub crop_trim_ratio: f32,
    pub prescan_delay_ms: u64,
    pub bind_address: String,
    pub log_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Run with the offline adapters when no API key is configured.
    pub allow_demo: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.into(),
            detection_model: DEFAULT_DETECTION_MODEL.into(),
            restoration_model: DEFAULT_RESTORATION_MODEL.into(),
            restore_concurrency: 3,
            request_timeout_secs: 120,
            crop_trim_ratio: 0.01,
            prescan_delay_ms: 0,
            bind_address: "127.0.0.1:8787".into(),
            log_dir: PathBuf::from("logs"),
            max_upload_bytes: 32 * 1024 * 1024,
            allow_demo: true,
        }
    }
}

impl ServiceSettings {
    /// Returns a redacted clone that replaces the key with a masked form when present.
    pub fn masked(&self) -> Self {
        let mut cloned = self.clone();
        if let Some(key) = cloned.api_key.as_mut() {
            // short keys would be mostly revealed by a prefix
            *key = if key.chars().count() > MASK_MIN_KEY_LEN {
                let prefix: String = key.chars().take(4).collect();
                format!("{}****", prefix)
            } else {
                "****".to_string()
            };
        }
        cloned
    }

    pub fn normalize(mut self) -> Self {
        self.api_key = self
            .api_key
            .take()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self.api_base = self.api_base.trim().trim_end_matches('/').to_string();
        if self.api_base.is_empty() {
            self.api_base = DEFAULT_API_BASE.into();
        }
        self.detection_model = self.detection_model.trim().to_string();
        self.restoration_model = self.restoration_model.trim().to_string();
        self.bind_address = self.bind_address.trim().to_string();
        self.restore_concurrency = self.restore_concurrency.max(1);
        self.crop_trim_ratio = self.crop_trim_ratio.clamp(0.0, 0.45);
        self
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.detection_model.is_empty() {
            return Err(SettingsError::Invalid {
                field: "detectionModel",
                reason: "must not be empty".into(),
            });
        }
        if self.restoration_model.is_empty() {
            return Err(SettingsError::Invalid {
                field: "restorationModel",
                reason: "must not be empty".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(SettingsError::Invalid {
                field: "requestTimeoutSecs",
                reason: "must be at least 1".into(),
            });
        }
        url::Url::parse(&self.api_base).map_err(|err| SettingsError::Invalid {
            field: "apiBase",
            reason: err.to_string(),
        })?;
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Applies environment overrides. The first non-empty key variable wins.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|name| env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let present = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(key) = API_KEY_VARS.iter().find_map(|&name| present(name)) {
            self.api_key = Some(key);
        }
        if let Some(base) = present("TISSAIA_API_BASE") {
            self.api_base = base;
        }
        if let Some(bind) = present("TISSAIA_BIND") {
            self.bind_address = bind;
        }
        self.normalize()
    }
}

pub fn load_settings(path: &Path) -> Result<ServiceSettings, SettingsError> {
    let bytes = fs::read(path).map_err(|source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let settings: ServiceSettings =
        serde_json::from_slice(&bytes).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(settings.normalize())
}

/// Reads `path` when it exists (defaults otherwise) and layers the environment on top.
pub fn resolve_settings(path: &Path) -> Result<ServiceSettings, SettingsError> {
    let base = if path.exists() {
        load_settings(path)?
    } else {
        ServiceSettings::default()
    };
    let settings = base.apply_env();
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &ServiceSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(settings)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(path, json)?;
    Ok(())
}

pub fn default_settings_path(root: &Path) -> PathBuf {
    root.join("tissaia.json")
}
