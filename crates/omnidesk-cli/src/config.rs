//! Omnidesk configuration — TOML file with env-var expansion

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmnideskConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "~/.omnidesk/omnidesk.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: String,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("auth_token", &mask_secret(&self.auth_token))
            .finish()
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8350
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: WhatsappConfig,
    #[serde(default)]
    pub facebook: FacebookConfig,
    #[serde(default)]
    pub instagram: InstagramConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WhatsappConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wa_channel_id")]
    pub channel_id: String,
    #[serde(default = "default_wa_bridge_url")]
    pub bridge_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_wa_poll_interval")]
    pub poll_interval_secs: u64,
}

impl std::fmt::Debug for WhatsappConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhatsappConfig")
            .field("enabled", &self.enabled)
            .field("channel_id", &self.channel_id)
            .field("bridge_url", &self.bridge_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

fn default_wa_channel_id() -> String {
    "wa-main".to_string()
}

fn default_wa_bridge_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_wa_poll_interval() -> u64 {
    2
}

impl Default for WhatsappConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_id: default_wa_channel_id(),
            bridge_url: default_wa_bridge_url(),
            api_key: String::new(),
            poll_interval_secs: default_wa_poll_interval(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FacebookConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fb_channel_id")]
    pub channel_id: String,
    #[serde(default = "default_fb_bridge_url")]
    pub bridge_url: String,
    #[serde(default)]
    pub app_state: String,
    #[serde(default = "default_graph_poll_interval")]
    pub poll_interval_secs: u64,
}

impl std::fmt::Debug for FacebookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacebookConfig")
            .field("enabled", &self.enabled)
            .field("channel_id", &self.channel_id)
            .field("bridge_url", &self.bridge_url)
            .field("app_state", &mask_secret(&self.app_state))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

fn default_fb_channel_id() -> String {
    "fb-main".to_string()
}

fn default_fb_bridge_url() -> String {
    "http://127.0.0.1:3001".to_string()
}

fn default_graph_poll_interval() -> u64 {
    5
}

impl Default for FacebookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_id: default_fb_channel_id(),
            bridge_url: default_fb_bridge_url(),
            app_state: String::new(),
            poll_interval_secs: default_graph_poll_interval(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct InstagramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ig_channel_id")]
    pub channel_id: String,
    #[serde(default = "default_ig_bridge_url")]
    pub bridge_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default = "default_graph_poll_interval")]
    pub poll_interval_secs: u64,
}

impl std::fmt::Debug for InstagramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstagramConfig")
            .field("enabled", &self.enabled)
            .field("channel_id", &self.channel_id)
            .field("bridge_url", &self.bridge_url)
            .field("username", &self.username)
            .field("session_token", &mask_secret(&self.session_token))
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}

fn default_ig_channel_id() -> String {
    "ig-main".to_string()
}

fn default_ig_bridge_url() -> String {
    "http://127.0.0.1:3002".to_string()
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_id: default_ig_channel_id(),
            bridge_url: default_ig_bridge_url(),
            username: String::new(),
            session_token: String::new(),
            poll_interval_secs: default_graph_poll_interval(),
        }
    }
}

/// Mask a secret string for safe display in Debug output / logs.
/// Shows first 3 and last 4 chars for values longer than 7 chars,
/// otherwise "***". Char-boundary-safe.
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".omnidesk")
}

impl OmnideskConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        // A world-readable config may leak tokens
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = std::fs::metadata(&path) {
                let mode = metadata.permissions().mode();
                if mode & 0o077 != 0 {
                    return Err(anyhow::anyhow!(
                        "Config file {:?} has overly permissive permissions ({:o}). \
                         It may contain secrets. Fix with: chmod 600 {:?}",
                        path,
                        mode & 0o777,
                        path
                    ));
                }
            }
        }

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `omnidesk init` first.",
                path.display()
            )
        })?;

        let expanded = expand_env_vars(&content);
        let config: Self = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;

        // A secret that appears literally in the raw file was not
        // supplied via ${VAR} expansion
        for (name, value) in [
            ("Hub auth token", &config.hub.auth_token),
            ("WhatsApp bridge key", &config.channels.whatsapp.api_key),
            ("Facebook app state", &config.channels.facebook.app_state),
            ("Instagram session token", &config.channels.instagram.session_token),
        ] {
            if !value.is_empty() && content.contains(value.as_str()) {
                warn!(
                    "{} is hardcoded in the config file. Prefer environment variables: \"${{VAR}}\"",
                    name
                );
            }
        }

        Ok(config)
    }
}

/// Env vars that may be expanded in config files. An attacker who can
/// edit the config must not be able to read arbitrary env vars.
const ALLOWED_ENV_VARS: &[&str] = &[
    "OMNIDESK_HUB_TOKEN",
    "WHATSAPP_BRIDGE_KEY",
    "FACEBOOK_APP_STATE",
    "INSTAGRAM_SESSION_TOKEN",
    "HOME",
    "USER",
];

fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let mut pos = 0;
    while pos < result.len() {
        if let Some(start) = result[pos..].find("${") {
            let abs_start = pos + start;
            if let Some(end) = result[abs_start..].find('}') {
                let var_name = result[abs_start + 2..abs_start + end].to_string();

                let value = if ALLOWED_ENV_VARS.contains(&var_name.as_str()) {
                    std::env::var(&var_name).unwrap_or_default()
                } else {
                    warn!(
                        "Skipping expansion of unrecognized env var '{}' in config (not in allowlist)",
                        var_name
                    );
                    pos = abs_start + end + 1;
                    continue;
                };

                let value_len = value.len();
                result = format!(
                    "{}{}{}",
                    &result[..abs_start],
                    value,
                    &result[abs_start + end + 1..]
                );
                pos = abs_start + value_len;
            } else {
                break;
            }
        } else {
            break;
        }
    }
    result
}

/// Expand `~` and `${VAR}` in a filesystem path.
pub fn shellexpand(s: &str) -> PathBuf {
    let mut result = s.to_string();
    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    }
    PathBuf::from(expand_env_vars(&result))
}
