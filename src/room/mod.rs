use anyhow::Result;
use async_trait::async_trait;

use crate::types::RoomSnapshot;

pub mod http;

/// Capability boundary to the chat room service. The reconciler and command
/// handlers only ever talk to the room through this trait; the HTTP session,
/// cookies and retry plumbing live behind it.
#[async_trait]
pub trait RoomClient: Send + Sync {
    /// Join the room and return the snapshot observed on entry.
    async fn join_room(&self, room_id: &str) -> Result<RoomSnapshot>;

    /// Fetch the current room snapshot (user list + recent event feed).
    async fn room_snapshot(&self, room_id: &str) -> Result<RoomSnapshot>;

    /// Post a chat message, optionally with an attached link or a whisper
    /// target.
    async fn post_message(&self, text: &str, url: Option<&str>, to: Option<&str>) -> Result<()>;

    /// Share a playable track with the room.
    async fn post_music(&self, title: &str, url: &str) -> Result<()>;

    async fn kick_user(&self, user_id: &str) -> Result<()>;

    async fn ban_user(&self, user_id: &str) -> Result<()>;

    async fn unban_user(&self, user_id: &str, user_name: &str) -> Result<()>;

    /// Leave the room gracefully.
    async fn leave_room(&self) -> Result<()>;
}
