// src/config/mod.rs - Bot configuration loaded from YAML with env overrides

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tokio::fs;
use url::Url;

/// Top-level bot configuration. Every field has a default so a partial YAML
/// file is enough; secrets (room id, session cookie) are usually supplied
/// through the environment instead of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Base URL of the chat service.
    pub base_url: String,
    /// Room to join. Env override: `POLLBOT_ROOM_ID`.
    pub room_id: String,
    /// Authenticated session cookie string. Env override: `POLLBOT_COOKIE`.
    pub cookie: String,
    /// Display name the bot runs under; used to recognize itself in the
    /// user list.
    pub bot_name: String,
    /// The single admin identity, matched by display name.
    pub admin_name: String,
    /// Announcement posted right after joining.
    pub online_message: String,
    pub moderation: ModerationConfig,
    pub schedule: ScheduleConfig,
    pub providers: ProviderConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationConfig {
    /// Messages allowed per user within `time_window_seconds`.
    pub message_limit: usize,
    pub time_window_seconds: i64,
    /// Identical messages tolerated within `repeat_window_seconds` before
    /// the sender is flagged.
    pub repeat_limit: usize,
    pub repeat_window_seconds: i64,
    /// Disallowed keywords, matched case-insensitively as substrings.
    pub keywords: Vec<String>,
    /// Durable per-user violation table.
    pub violations_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub poll_interval_seconds: u64,
    pub keep_alive_interval_seconds: i64,
    pub hang_room_interval_seconds: i64,
    pub auto_play_interval_seconds: i64,
    pub heartbeat_interval_seconds: i64,
    pub heartbeat_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub ai_api_url: String,
    /// Model identifiers the AI endpoint accepts.
    pub ai_models: Vec<String>,
    pub default_ai_model: String,
    pub qq_music_api_url: String,
    pub netease_music_api_url: String,
    pub tts_api_url: String,
    pub tts_voice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// AI chat answers; off until the admin enables it in-room.
    pub ai_enabled: bool,
    /// Automatic kick/ban escalation for repeat offenders.
    pub ai_manage_enabled: bool,
    /// Periodic idle message keeping the room alive.
    pub hang_room_enabled: bool,
    /// Automatic playback from the playlist.
    pub auto_play_enabled: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            base_url: "https://drrr.com".to_string(),
            room_id: String::new(),
            cookie: String::new(),
            bot_name: "AI机器人".to_string(),
            admin_name: "52Hertz".to_string(),
            online_message: "AI机器人已上线".to_string(),
            moderation: ModerationConfig::default(),
            schedule: ScheduleConfig::default(),
            providers: ProviderConfig::default(),
            features: FeatureFlags::default(),
        }
    }
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            message_limit: 5,
            time_window_seconds: 60,
            repeat_limit: 3,
            repeat_window_seconds: 300,
            keywords: default_keywords(),
            violations_file: "user_violations.json".to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 3,
            keep_alive_interval_seconds: 180,
            hang_room_interval_seconds: 1200,
            auto_play_interval_seconds: 300,
            heartbeat_interval_seconds: 60,
            heartbeat_file: "bot_heartbeat.json".to_string(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ai_api_url: "https://api.suyanw.cn/api/zpai.php".to_string(),
            ai_models: vec!["V3".to_string(), "R1".to_string()],
            default_ai_model: "V3".to_string(),
            qq_music_api_url: "https://api.suyanw.cn/api/QQ_Music.php".to_string(),
            netease_music_api_url: "https://api.suyanw.cn/api/Netease_Music.php".to_string(),
            tts_api_url: "https://api.suyanw.cn/api/tts.php".to_string(),
            tts_voice: "素颜".to_string(),
        }
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            ai_enabled: false,
            ai_manage_enabled: true,
            hang_room_enabled: true,
            auto_play_enabled: false,
        }
    }
}

fn default_keywords() -> Vec<String> {
    [
        "暴力", "色情", "赌博", "毒品", "诈骗", "骂人", "脏话", "攻击",
        "威胁", "恐吓", "歧视", "仇恨", "违法", "敏感", "政治", "宗教",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl BotConfig {
    /// Load configuration from a YAML file, creating a default file first if
    /// none exists, then apply environment overrides and validate.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            warn!("Config file not found, creating default: {}", path.display());
            let yaml = serde_yaml::to_string(&BotConfig::default())
                .context("Failed to serialize default config")?;
            fs::write(path, yaml)
                .await
                .with_context(|| format!("Failed to write default config: {}", path.display()))?;
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let mut config: BotConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;

        info!(
            "Loaded configuration for room '{}' as '{}'",
            config.room_id, config.bot_name
        );
        Ok(config)
    }

    /// Environment variables win over file values for the per-deployment
    /// secrets.
    fn apply_env_overrides(&mut self) {
        if let Ok(room_id) = env::var("POLLBOT_ROOM_ID") {
            self.room_id = room_id;
        }
        if let Ok(cookie) = env::var("POLLBOT_COOKIE") {
            self.cookie = cookie;
        }
        if let Ok(admin) = env::var("POLLBOT_ADMIN") {
            self.admin_name = admin;
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("base_url", &self.base_url),
            ("ai_api_url", &self.providers.ai_api_url),
            ("qq_music_api_url", &self.providers.qq_music_api_url),
            ("netease_music_api_url", &self.providers.netease_music_api_url),
            ("tts_api_url", &self.providers.tts_api_url),
        ] {
            Url::parse(value).with_context(|| format!("Invalid URL in config field '{}': {}", name, value))?;
        }

        if self.moderation.message_limit == 0 {
            return Err(anyhow::anyhow!("moderation.message_limit must be at least 1"));
        }
        if self.moderation.repeat_limit == 0 {
            return Err(anyhow::anyhow!("moderation.repeat_limit must be at least 1"));
        }
        if self.schedule.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("schedule.poll_interval_seconds must be at least 1"));
        }
        if !self.providers.ai_models.contains(&self.providers.default_ai_model) {
            return Err(anyhow::anyhow!(
                "default_ai_model '{}' is not in ai_models",
                self.providers.default_ai_model
            ));
        }

        Ok(())
    }
}
