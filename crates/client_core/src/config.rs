use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use tracing::warn;
use url::Url;

pub const SETTINGS_FILE: &str = "thogmi.toml";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the main REST API (`/auth/*`, `/branches/*`, ...).
    pub api_base_url: String,
    /// Root of the communications REST API.
    pub communications_url: String,
    /// `host[:port]` of the chat WebSocket endpoint.
    pub ws_host: String,
    pub currency: String,
    pub google_maps_api_key: Option<String>,
    /// Where the session is persisted; `None` keeps it in memory only.
    pub session_file: Option<PathBuf>,
    pub request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".into(),
            communications_url: "http://localhost:8000/communications/api".into(),
            ws_host: "localhost:8000".into(),
            currency: "GHS".into(),
            google_maps_api_key: None,
            session_file: dirs::config_dir().map(|dir| dir.join("thogmi").join("session.json")),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Settings {
    /// Scheme for chat sockets follows the API: `wss` behind https, `ws` otherwise.
    pub fn ws_scheme(&self) -> &'static str {
        if self.api_base_url.starts_with("https://") {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn api_base(&self) -> Result<Url, url::ParseError> {
        Url::parse(&with_trailing_slash(&self.api_base_url))
    }

    pub fn communications_base(&self) -> Result<Url, url::ParseError> {
        Url::parse(&with_trailing_slash(&self.communications_url))
    }
}

fn with_trailing_slash(raw: &str) -> String {
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}

/// Defaults, then `thogmi.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, &file_cfg),
            Err(err) => warn!(file = SETTINGS_FILE, "ignoring unreadable settings file: {err}"),
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("api_url") {
        settings.api_base_url = v.clone();
    }
    if let Some(v) = file_cfg.get("communications_url") {
        settings.communications_url = v.clone();
    }
    if let Some(v) = file_cfg.get("ws_url") {
        settings.ws_host = strip_ws_scheme(v);
    }
    if let Some(v) = file_cfg.get("currency") {
        settings.currency = v.clone();
    }
    if let Some(v) = file_cfg.get("google_maps_api_key") {
        settings.google_maps_api_key = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("session_file") {
        settings.session_file = session_path(v);
    }
    if let Some(v) = file_cfg.get("request_timeout_secs") {
        apply_timeout(settings, v);
    }
}

fn apply_env_settings(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("THOGMI_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("THOGMI_COMMUNICATIONS_URL") {
        settings.communications_url = v;
    }

    if let Some(v) = env("THOGMI_WS_URL") {
        settings.ws_host = strip_ws_scheme(&v);
    }
    if let Some(v) = env("APP__WS_URL") {
        settings.ws_host = strip_ws_scheme(&v);
    }

    if let Some(v) = env("THOGMI_CURRENCY") {
        settings.currency = v;
    }

    if let Some(v) = env("THOGMI_GOOGLE_MAPS_API_KEY") {
        settings.google_maps_api_key = Some(v);
    }

    if let Some(v) = env("THOGMI_SESSION_FILE") {
        settings.session_file = session_path(&v);
    }

    if let Some(v) = env("THOGMI_REQUEST_TIMEOUT_SECS") {
        apply_timeout(settings, &v);
    }
}

fn apply_timeout(settings: &mut Settings, raw: &str) {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => settings.request_timeout = Duration::from_secs(secs),
        _ => warn!(value = raw, "ignoring invalid request timeout"),
    }
}

/// Empty or `memory` disables the on-disk session.
fn session_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("memory") {
        None
    } else {
        Some(PathBuf::from(raw))
    }
}

fn strip_ws_scheme(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("wss://")
        .trim_start_matches("ws://")
        .trim_end_matches('/')
        .to_string()
}
