use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

const SETTINGS_FILE: &str = "client.toml";
const SESSION_FILE: &str = "session.json";
const APP_DIR: &str = "chat-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub cache_ttl: Duration,
    pub inter_call_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            inter_call_delay: Duration::from_millis(50),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSettings {
    pub verify_min_interval: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            verify_min_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub batch_limit: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
            batch_limit: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSettings {
    pub expiry: Duration,
}

impl Default for TypingSettings {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub push_url: Option<String>,
    pub session_file: Option<PathBuf>,
    pub gateway: GatewaySettings,
    pub auth: AuthSettings,
    pub poll: PollSettings,
    pub typing: TypingSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            push_url: None,
            session_file: None,
            gateway: GatewaySettings::default(),
            auth: AuthSettings::default(),
            poll: PollSettings::default(),
            typing: TypingSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Websocket endpoint: the explicit push url, or the server url with its
    /// scheme swapped and `/ws` appended.
    pub fn resolved_push_url(&self) -> anyhow::Result<String> {
        if let Some(push_url) = &self.push_url {
            return Ok(push_url.clone());
        }
        let server_url = self.server_url.trim_end_matches('/');
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            anyhow::bail!("server_url must start with http:// or https://");
        };
        Ok(format!("{ws_url}/ws"))
    }

    pub fn resolved_session_file(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.session_file {
            return Ok(path.clone());
        }
        let config_dir = dirs::config_dir().context("could not find config directory")?;
        Ok(config_dir.join(APP_DIR).join(SESSION_FILE))
    }
}

/// On-disk overlay. Every field is optional; durations are milliseconds.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    push_url: Option<String>,
    session_file: Option<PathBuf>,
    cache_ttl_ms: Option<u64>,
    inter_call_delay_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    verify_min_interval_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    poll_failure_threshold: Option<u32>,
    poll_cooldown_ms: Option<u64>,
    poll_batch_limit: Option<u32>,
    typing_expiry_ms: Option<u64>,
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config: ignoring malformed settings file")
            }
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.push_url {
        settings.push_url = Some(v);
    }
    if let Some(v) = file_cfg.session_file {
        settings.session_file = Some(v);
    }
    if let Some(v) = file_cfg.cache_ttl_ms {
        settings.gateway.cache_ttl = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.inter_call_delay_ms {
        settings.gateway.inter_call_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.request_timeout_ms {
        settings.gateway.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.verify_min_interval_ms {
        settings.auth.verify_min_interval = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.poll_interval_ms {
        settings.poll.interval = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.poll_failure_threshold {
        settings.poll.failure_threshold = v.max(1);
    }
    if let Some(v) = file_cfg.poll_cooldown_ms {
        settings.poll.cooldown = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.poll_batch_limit {
        settings.poll.batch_limit = v;
    }
    if let Some(v) = file_cfg.typing_expiry_ms {
        settings.typing.expiry = Duration::from_millis(v);
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__PUSH_URL") {
        settings.push_url = Some(v);
    }
    if let Some(v) = lookup("APP__SESSION_FILE") {
        settings.session_file = Some(PathBuf::from(v));
    }

    let millis = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
    if let Some(v) = millis("APP__CACHE_TTL_MS") {
        settings.gateway.cache_ttl = Duration::from_millis(v);
    }
    if let Some(v) = millis("APP__INTER_CALL_DELAY_MS") {
        settings.gateway.inter_call_delay = Duration::from_millis(v);
    }
    if let Some(v) = millis("APP__REQUEST_TIMEOUT_MS") {
        settings.gateway.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = millis("APP__VERIFY_MIN_INTERVAL_MS") {
        settings.auth.verify_min_interval = Duration::from_millis(v);
    }
    if let Some(v) = millis("APP__POLL_INTERVAL_MS") {
        settings.poll.interval = Duration::from_millis(v);
    }
    if let Some(v) = millis("APP__POLL_COOLDOWN_MS") {
        settings.poll.cooldown = Duration::from_millis(v);
    }
    if let Some(v) = millis("APP__TYPING_EXPIRY_MS") {
        settings.typing.expiry = Duration::from_millis(v);
    }

    let count = |key: &str| lookup(key).and_then(|v| v.parse::<u32>().ok());
    if let Some(v) = count("APP__POLL_FAILURE_THRESHOLD") {
        settings.poll.failure_threshold = v.max(1);
    }
    if let Some(v) = count("APP__POLL_BATCH_LIMIT") {
        settings.poll.batch_limit = v;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let settings = ClientSettings::default();
        assert_eq!(settings.gateway.cache_ttl, Duration::from_secs(30));
        assert_eq!(settings.gateway.inter_call_delay, Duration::from_millis(50));
        assert_eq!(settings.auth.verify_min_interval, Duration::from_secs(30));
        assert_eq!(settings.poll.interval, Duration::from_secs(5));
        assert_eq!(settings.poll.cooldown, Duration::from_secs(10));
        assert_eq!(settings.typing.expiry, Duration::from_secs(3));
    }

    #[test]
    fn file_values_then_env_values_take_precedence() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("chat_sync_settings_{suffix}.toml"));
        fs::write(
            &path,
            "server_url = \"https://chat.example\"\npoll_interval_ms = 1500\ncache_ttl_ms = 100\n",
        )
        .expect("write settings");

        let mut settings = ClientSettings::default();
        let raw = fs::read_to_string(&path).expect("read settings");
        apply_file_settings(&mut settings, toml::from_str(&raw).expect("parse"));
        let env_values: HashMap<&str, &str> = [("APP__CACHE_TTL_MS", "250")].into();
        apply_env_overrides(&mut settings, |key| {
            env_values.get(key).map(|v| v.to_string())
        });

        assert_eq!(settings.server_url, "https://chat.example");
        assert_eq!(settings.poll.interval, Duration::from_millis(1500));
        assert_eq!(settings.gateway.cache_ttl, Duration::from_millis(250));
        fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn push_url_is_derived_from_server_url() {
        let settings = ClientSettings {
            server_url: "https://chat.example/".into(),
            ..ClientSettings::default()
        };
        assert_eq!(
            settings.resolved_push_url().expect("push url"),
            "wss://chat.example/ws"
        );

        let invalid = ClientSettings {
            server_url: "chat.example".into(),
            ..ClientSettings::default()
        };
        assert!(invalid.resolved_push_url().is_err());
    }

    #[test]
    fn malformed_numbers_in_env_are_ignored() {
        let mut settings = ClientSettings::default();
        apply_env_overrides(&mut settings, |key| {
            (key == "APP__POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert_eq!(settings.poll.interval, Duration::from_secs(5));
    }

    #[test]
    fn poll_counts_can_be_overridden_from_env() {
        let env_values: HashMap<&str, &str> = [
            ("APP__POLL_FAILURE_THRESHOLD", "0"),
            ("APP__POLL_BATCH_LIMIT", "20"),
        ]
        .into();
        let mut settings = ClientSettings::default();
        apply_env_overrides(&mut settings, |key| {
            env_values.get(key).map(|v| v.to_string())
        });
        assert_eq!(settings.poll.failure_threshold, 1);
        assert_eq!(settings.poll.batch_limit, 20);
    }
}
