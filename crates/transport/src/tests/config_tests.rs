use std::collections::HashMap;

use crate::config::{apply_overrides, ClientSettings};

#[test]
fn defaults_match_local_development_setup() {
    let settings = ClientSettings::default();
    assert_eq!(settings.server_url, "http://127.0.0.1:8000");
    assert_eq!(settings.request_timeout_secs, 30);
    assert_eq!(settings.label_cache_ttl_secs, 120);
}

#[test]
fn overrides_replace_known_keys() {
    let mut overrides = HashMap::new();
    overrides.insert("server_url".to_string(), "https://crm.example".to_string());
    overrides.insert("request_timeout_secs".to_string(), "5".to_string());
    overrides.insert("label_cache_ttl_secs".to_string(), "60".to_string());

    let settings = apply_overrides(ClientSettings::default(), &overrides);
    assert_eq!(settings.server_url, "https://crm.example");
    assert_eq!(settings.request_timeout_secs, 5);
    assert_eq!(settings.label_cache_ttl_secs, 60);
}

#[test]
fn unparsable_numbers_keep_previous_values() {
    let mut overrides = HashMap::new();
    overrides.insert("request_timeout_secs".to_string(), "soon".to_string());

    let settings = apply_overrides(ClientSettings::default(), &overrides);
    assert_eq!(settings.request_timeout_secs, 30);
}

#[test]
fn unknown_keys_are_ignored() {
    let mut overrides = HashMap::new();
    overrides.insert("metrics_port".to_string(), "9100".to_string());

    let settings = apply_overrides(ClientSettings::default(), &overrides);
    assert_eq!(settings.server_url, ClientSettings::default().server_url);
}
