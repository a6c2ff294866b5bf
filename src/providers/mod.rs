use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

pub mod http;

/// Failure classes of the AI text-generation endpoint. The command layer
/// retries on every one of these and words its final chat reply by the last
/// class observed.
#[derive(Debug, Clone, Error)]
pub enum AiError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("empty response content")]
    EmptyResponse,
    #[error("unexpected status {0}")]
    BadStatus(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Text-generation capability.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AiError>;
}

/// A track found by a music search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub url: String,
}

/// Music search capability. One instance per backing catalog.
#[async_trait]
pub trait MusicProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<TrackInfo>;
}

/// Text-to-speech capability; returns the URL of the synthesized audio.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<String>;
}
