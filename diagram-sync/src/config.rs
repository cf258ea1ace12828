//! Client-side sync settings.

use std::time::Duration;

use crate::debounce::DEFAULT_DEBOUNCE;
use crate::remote::HttpDiagramStore;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Document store base URL (`/api` is appended when missing)
    pub api_url: String,
    /// Relay WebSocket URL
    pub realtime_url: String,
    pub debounce: Duration,
    pub access_token: Option<String>,
    /// Display token sent with `join`
    pub user_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".to_string(),
            realtime_url: "ws://127.0.0.1:9090".to_string(),
            debounce: DEFAULT_DEBOUNCE,
            access_token: None,
            user_id: "anonymous".to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `DIAGRAM_API_URL`, `DIAGRAM_REALTIME_URL`,
    /// `DIAGRAM_DEBOUNCE_MS`, `DIAGRAM_ACCESS_TOKEN` and `DIAGRAM_USER_ID`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup("DIAGRAM_API_URL").filter(|v| !v.is_empty()) {
            config.api_url = url;
        }
        if let Some(url) = lookup("DIAGRAM_REALTIME_URL").filter(|v| !v.is_empty()) {
            config.realtime_url = url;
        }
        if let Some(raw) = lookup("DIAGRAM_DEBOUNCE_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.debounce = Duration::from_millis(ms),
                Err(e) => log::warn!("Ignoring DIAGRAM_DEBOUNCE_MS={raw:?}: {e}"),
            }
        }
        config.access_token = lookup("DIAGRAM_ACCESS_TOKEN").filter(|v| !v.is_empty());
        if let Some(user) = lookup("DIAGRAM_USER_ID").filter(|v| !v.is_empty()) {
            config.user_id = user;
        }
        config
    }

    pub fn http_store(&self) -> HttpDiagramStore {
        HttpDiagramStore::new(self.api_url.clone()).with_access_token(self.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("DIAGRAM_API_URL", "https://diagrams.example.com"),
            ("DIAGRAM_DEBOUNCE_MS", "750"),
            ("DIAGRAM_ACCESS_TOKEN", ""),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.api_url, "https://diagrams.example.com");
        assert_eq!(config.realtime_url, SyncConfig::default().realtime_url);
        assert_eq!(config.debounce, Duration::from_millis(750));
        assert_eq!(config.access_token, None);
    }

    #[test]
    fn test_bad_debounce_keeps_default() {
        let config = SyncConfig::from_lookup(|k| (k == "DIAGRAM_DEBOUNCE_MS").then(|| "soon".to_string()));
        assert_eq!(config.debounce, DEFAULT_DEBOUNCE);
    }
}
