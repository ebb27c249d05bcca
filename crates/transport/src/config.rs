use std::{collections::HashMap, fs, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub request_timeout_secs: u64,
    pub label_cache_ttl_secs: u64,
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn label_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.label_cache_ttl_secs)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".into(),
            request_timeout_secs: 30,
            label_cache_ttl_secs: 120,
        }
    }
}

pub(crate) fn apply_overrides(
    mut settings: ClientSettings,
    overrides: &HashMap<String, String>,
) -> ClientSettings {
    if let Some(v) = overrides.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = overrides.get("request_timeout_secs") {
        if let Ok(parsed) = v.parse() {
            settings.request_timeout_secs = parsed;
        }
    }
    if let Some(v) = overrides.get("label_cache_ttl_secs") {
        if let Ok(parsed) = v.parse() {
            settings.label_cache_ttl_secs = parsed;
        }
    }
    settings
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            settings = apply_overrides(settings, &file_cfg);
        }
    }

    let mut env_cfg = HashMap::new();
    for key in ["server_url", "request_timeout_secs", "label_cache_ttl_secs"] {
        let plain = format!("CLIENT_{}", key.to_uppercase());
        let prefixed = format!("APP__{}", key.to_uppercase());
        if let Ok(v) = std::env::var(plain) {
            env_cfg.insert(key.to_string(), v);
        }
        if let Ok(v) = std::env::var(prefixed) {
            env_cfg.insert(key.to_string(), v);
        }
    }

    apply_overrides(settings, &env_cfg)
}
