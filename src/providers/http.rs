// src/providers/http.rs - HTTP implementations of the provider capabilities

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;

use crate::providers::{AiError, AiProvider, MusicProvider, TrackInfo, TtsProvider};

/// The AI endpoint can take close to a minute on long generations.
const AI_TIMEOUT: Duration = Duration::from_secs(70);
/// Music search and TTS answer fast or not at all.
const LIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Text generation over a GET endpoint returning
/// `{"status": "success", "content": "..."}`.
pub struct HttpAiProvider {
    client: reqwest::Client,
    api_url: String,
}

impl HttpAiProvider {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .build()
                .context("Failed to build AI provider HTTP client")?,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
    async fn generate(&self, prompt: &str) -> Result<String, AiError> {
        debug!("Calling AI endpoint: {}", self.api_url);

        let response = self
            .client
            .get(&self.api_url)
            .query(&[("msg", prompt)])
            .timeout(AI_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::Timeout
                } else {
                    AiError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("AI endpoint returned status {}", status);
            return Err(AiError::BadStatus(status.as_u16()));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AiError::Timeout
            } else {
                AiError::Network(e.to_string())
            }
        })?;

        parse_ai_payload(&text)
    }
}

#[derive(Debug, Deserialize)]
struct AiPayload {
    #[serde(default)]
    status: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    message: String,
}

fn parse_ai_payload(text: &str) -> Result<String, AiError> {
    let payload: AiPayload =
        serde_json::from_str(text).map_err(|e| AiError::Malformed(e.to_string()))?;

    if payload.status != "success" {
        let detail = if payload.message.is_empty() {
            format!("status '{}'", payload.status)
        } else {
            payload.message
        };
        return Err(AiError::Malformed(detail));
    }

    let content = payload.content.trim();
    if content.is_empty() {
        return Err(AiError::EmptyResponse);
    }
    Ok(content.to_string())
}

/// Music search over a GET endpoint returning
/// `{"code": 200, "data": {"title", "singer", "url"}}`.
pub struct HttpMusicProvider {
    client: reqwest::Client,
    api_url: String,
}

impl HttpMusicProvider {
    pub fn new(api_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(LIGHT_TIMEOUT)
                .build()
                .context("Failed to build music provider HTTP client")?,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl MusicProvider for HttpMusicProvider {
    async fn search(&self, query: &str) -> Result<TrackInfo> {
        debug!("Searching music endpoint {} for '{}'", self.api_url, query);

        let response = self
            .client
            .get(&self.api_url)
            .query(&[("msg", query), ("n", "1")])
            .send()
            .await
            .context("Music search request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Music search returned status {}", status));
        }

        let text = response.text().await.context("Music search body read failed")?;
        parse_track_payload(&text)
    }
}

#[derive(Debug, Deserialize)]
struct MusicPayload {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Option<MusicData>,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct MusicData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    singer: String,
    #[serde(default)]
    url: String,
}

fn parse_track_payload(text: &str) -> Result<TrackInfo> {
    let payload: MusicPayload =
        serde_json::from_str(text).context("Music search response was not valid JSON")?;

    if payload.code != 200 {
        let detail = if payload.text.is_empty() {
            format!("code {}", payload.code)
        } else {
            payload.text
        };
        return Err(anyhow::anyhow!("Music search failed: {}", detail));
    }

    let data = payload
        .data
        .ok_or_else(|| anyhow::anyhow!("Music search returned no track"))?;
    if data.url.is_empty() {
        return Err(anyhow::anyhow!("Music search returned no playable url"));
    }

    Ok(TrackInfo {
        title: if data.title.is_empty() {
            "未知歌曲".to_string()
        } else {
            data.title
        },
        artist: if data.singer.is_empty() {
            "未知歌手".to_string()
        } else {
            data.singer
        },
        url: data.url,
    })
}

/// Text-to-speech over a GET endpoint returning
/// `{"code": 200, "data": {"file_link": "..."}}`.
pub struct HttpTtsProvider {
    client: reqwest::Client,
    api_url: String,
    voice: String,
}

impl HttpTtsProvider {
    pub fn new(api_url: impl Into<String>, voice: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(LIGHT_TIMEOUT)
                .build()
                .context("Failed to build TTS provider HTTP client")?,
            api_url: api_url.into(),
            voice: voice.into(),
        })
    }
}

#[async_trait]
impl TtsProvider for HttpTtsProvider {
    async fn synthesize(&self, text: &str) -> Result<String> {
        debug!("Calling TTS endpoint: {}", self.api_url);

        let response = self
            .client
            .get(&self.api_url)
            .query(&[("text", text), ("voice", self.voice.as_str())])
            .send()
            .await
            .context("TTS request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("TTS returned status {}", status));
        }

        let body = response.text().await.context("TTS body read failed")?;
        parse_tts_payload(&body)
    }
}

#[derive(Debug, Deserialize)]
struct TtsPayload {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Option<TtsData>,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TtsData {
    #[serde(default)]
    file_link: String,
}

fn parse_tts_payload(text: &str) -> Result<String> {
    let payload: TtsPayload =
        serde_json::from_str(text).context("TTS response was not valid JSON")?;

    if payload.code != 200 {
        let detail = if payload.msg.is_empty() {
            format!("code {}", payload.code)
        } else {
            payload.msg
        };
        return Err(anyhow::anyhow!("TTS failed: {}", detail));
    }

    let link = payload
        .data
        .map(|d| d.file_link)
        .unwrap_or_default();
    if link.is_empty() {
        return Err(anyhow::anyhow!("TTS returned no audio link"));
    }
    Ok(link)
}
