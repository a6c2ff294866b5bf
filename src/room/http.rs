// src/room/http.rs - reqwest-backed RoomClient against the service JSON API

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, USER_AGENT};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::BotConfig;
use crate::room::RoomClient;
use crate::types::{EventKind, RoomEvent, RoomSnapshot, User};

/// Bound on every room operation.
const ROOM_TIMEOUT: Duration = Duration::from_secs(30);
/// Post retry policy: transient transport failures get a couple of retries
/// before the error surfaces to the caller.
const MAX_POST_ATTEMPTS: u32 = 3;
const POST_RETRY_DELAY: Duration = Duration::from_secs(2);

const BROWSER_UA: &str = "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/91.0.4472.124 Mobile Safari/537.36";

/// HTTP implementation of [`RoomClient`]. One authenticated session per bot
/// identity; the service recognizes the session cookie, so every room call
/// is a plain GET/POST against the `room/` endpoint.
pub struct HttpRoomClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRoomClient {
    pub fn new(config: &BotConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&config.cookie).context("Session cookie is not a valid header value")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(ROOM_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_room_info(&self, room_id: &str) -> Result<RoomSnapshot> {
        let url = format!("{}/room/?id={}&api=json", self.base_url, room_id);
        debug!("Fetching room info: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Room info request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Room info request returned status {}", status));
        }

        let info: RoomInfoResponse = response
            .json()
            .await
            .context("Room info response was not valid JSON")?;

        Ok(info.into_snapshot())
    }

    /// POST a form to the ajax endpoint, retrying transient failures.
    async fn post_form(&self, form: &[(&str, &str)]) -> Result<()> {
        let url = format!("{}/room/?ajax=1&api=json", self.base_url);
        let mut last_error = None;

        for attempt in 1..=MAX_POST_ATTEMPTS {
            match self.client.post(&url).form(form).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    warn!(
                        "Room post returned status {} (attempt {}/{})",
                        response.status(),
                        attempt,
                        MAX_POST_ATTEMPTS
                    );
                    last_error = Some(anyhow::anyhow!(
                        "Room post returned status {}",
                        response.status()
                    ));
                }
                Err(e) => {
                    warn!("Room post failed: {} (attempt {}/{})", e, attempt, MAX_POST_ATTEMPTS);
                    last_error = Some(anyhow::Error::new(e).context("Room post request failed"));
                }
            }
            if attempt < MAX_POST_ATTEMPTS {
                sleep(POST_RETRY_DELAY).await;
            }
        }

        let err = last_error.unwrap_or_else(|| anyhow::anyhow!("Room post failed"));
        error!("Room post gave up after {} attempts", MAX_POST_ATTEMPTS);
        Err(err)
    }
}

#[async_trait]
impl RoomClient for HttpRoomClient {
    async fn join_room(&self, room_id: &str) -> Result<RoomSnapshot> {
        let url = format!("{}/room/?id={}", self.base_url, room_id);
        info!("Joining room: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Join request failed")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Join request returned status {}", status));
        }

        // Joining is a page visit; the snapshot confirms we actually landed
        // in the room.
        self.fetch_room_info(room_id).await
    }

    async fn room_snapshot(&self, room_id: &str) -> Result<RoomSnapshot> {
        self.fetch_room_info(room_id).await
    }

    async fn post_message(&self, text: &str, url: Option<&str>, to: Option<&str>) -> Result<()> {
        let mut form = vec![("message", text)];
        if let Some(url) = url {
            form.push(("url", url));
        }
        if let Some(to) = to {
            form.push(("to", to));
        }
        self.post_form(&form).await
    }

    async fn post_music(&self, title: &str, url: &str) -> Result<()> {
        self.post_form(&[("music", "music"), ("name", title), ("url", url)])
            .await
    }

    async fn kick_user(&self, user_id: &str) -> Result<()> {
        self.post_form(&[("kick", user_id)]).await
    }

    async fn ban_user(&self, user_id: &str) -> Result<()> {
        self.post_form(&[("ban", user_id)]).await
    }

    async fn unban_user(&self, user_id: &str, user_name: &str) -> Result<()> {
        self.post_form(&[("unban", user_id), ("userName", user_name)])
            .await
    }

    async fn leave_room(&self) -> Result<()> {
        self.post_form(&[("leave", "leave")]).await
    }
}

// Wire types for the service's room payload. Only the fields the bot reads
// are modeled; everything else is ignored.

#[derive(Debug, Deserialize)]
struct RoomInfoResponse {
    #[serde(default)]
    room: Option<WireRoom>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRoom {
    #[serde(default)]
    users: Vec<WireUser>,
    #[serde(default)]
    talks: Vec<WireTalk>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireTalk {
    #[serde(rename = "type", default)]
    kind: Option<EventKind>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    from: Option<WireUser>,
    #[serde(default)]
    time: i64,
}

impl RoomInfoResponse {
    fn into_snapshot(self) -> RoomSnapshot {
        let room = self.room.unwrap_or_default();

        let users = room
            .users
            .into_iter()
            .map(|u| User::new(u.id, u.name))
            .collect();

        // Talks without a sender are service notices; they carry nothing the
        // pipeline acts on.
        let events = room
            .talks
            .into_iter()
            .filter_map(|talk| {
                let from = talk.from?;
                Some(RoomEvent {
                    kind: talk.kind.unwrap_or(EventKind::Other),
                    sender: User::new(from.id, from.name),
                    body: talk.message,
                    timestamp: talk.time,
                })
            })
            .collect();

        RoomSnapshot { users, events }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_room_payload() {
        let payload = r#"{
            "room": {
                "users": [
                    {"id": "u1", "name": "alice"},
                    {"id": "u2", "name": "bob"}
                ],
                "talks": [
                    {"type": "message", "message": "hi", "from": {"id": "u1", "name": "alice"}, "time": 1700000000},
                    {"type": "join", "message": "", "from": {"id": "u2", "name": "bob"}, "time": 1700000001},
                    {"type": "new-host", "message": "", "time": 1700000002}
                ]
            }
        }"#;

        let info: RoomInfoResponse = serde_json::from_str(payload).unwrap();
        let snapshot = info.into_snapshot();

        assert_eq!(snapshot.users.len(), 2);
        // The senderless notice is dropped.
        assert_eq!(snapshot.events.len(), 2);
        assert_eq!(snapshot.events[0].kind, EventKind::Message);
        assert_eq!(snapshot.events[0].body, "hi");
        assert_eq!(snapshot.events[1].kind, EventKind::Join);
    }

    #[test]
    fn parses_payload_without_room() {
        let info: RoomInfoResponse = serde_json::from_str("{}").unwrap();
        let snapshot = info.into_snapshot();
        assert!(snapshot.users.is_empty());
        assert!(snapshot.events.is_empty());
    }
}
