// src/bot/outbox.rs - Single-writer queue in front of the room transport

use log::{debug, error};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::room::RoomClient;
use crate::types::OutgoingMessage;

/// The service rejects chat messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 100;
/// Pause between the segments of one long reply. The transport offers no
/// ordering guarantee across rapid consecutive posts.
const SEGMENT_DELAY: Duration = Duration::from_secs(1);

/// One unit of outbound work for the worker.
enum OutboundItem {
    Chat(OutgoingMessage),
    Music { title: String, url: String },
}

/// Handle for queueing outbound replies. Clone freely; all clones feed the
/// same worker, which is the only code path that touches the room transport,
/// so multi-part messages are never interleaved by concurrent senders.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutboundItem>,
}

impl Outbox {
    pub async fn say(&self, text: impl Into<String>) {
        self.post(OutgoingMessage::text(text)).await;
    }

    pub async fn post(&self, message: OutgoingMessage) {
        self.send(OutboundItem::Chat(message)).await;
    }

    /// Queue a playable track share.
    pub async fn play(&self, title: impl Into<String>, url: impl Into<String>) {
        self.send(OutboundItem::Music {
            title: title.into(),
            url: url.into(),
        })
        .await;
    }

    async fn send(&self, item: OutboundItem) {
        if self.tx.send(item).await.is_err() {
            error!("Outbox worker is gone, dropping outbound message");
        }
    }
}

/// Start the outbox worker. The worker drains the queue until every handle
/// is dropped, then exits; await the handle during shutdown to flush.
pub fn spawn(room: Arc<dyn RoomClient>) -> (Outbox, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OutboundItem>(100);

    let handle = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                OutboundItem::Chat(message) => deliver(room.as_ref(), message).await,
                OutboundItem::Music { title, url } => {
                    if let Err(e) = room.post_music(&title, &url).await {
                        error!("Failed to post music: {:#}", e);
                    }
                }
            }
        }
        debug!("Outbox drained, worker exiting");
    });

    (Outbox { tx }, handle)
}

async fn deliver(room: &dyn RoomClient, message: OutgoingMessage) {
    let segments = split_message(&message.text, MAX_MESSAGE_CHARS);
    let total = segments.len();

    for (i, segment) in segments.iter().enumerate() {
        let text = if total > 1 {
            format!("[{}/{}] {}", i + 1, total, segment)
        } else {
            segment.clone()
        };

        if let Err(e) = room
            .post_message(&text, message.url.as_deref(), message.to.as_deref())
            .await
        {
            error!("Failed to post message: {:#}", e);
        }

        if i + 1 < total {
            sleep(SEGMENT_DELAY).await;
        }
    }
}

/// Split `message` into segments of at most `max_chars` characters,
/// preferring to break at line boundaries. A single line longer than the
/// limit is hard-cut at the limit. Limits are in characters, not bytes; the
/// room counts CJK text the same as ASCII.
pub fn split_message(message: &str, max_chars: usize) -> Vec<String> {
    if message.chars().count() <= max_chars {
        return vec![message.to_string()];
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for line in message.split('\n') {
        let line_chars = line.chars().count();

        if line_chars > max_chars {
            if !current.is_empty() {
                segments.push(std::mem::take(&mut current));
            }
            let chars: Vec<char> = line.chars().collect();
            let mut start = 0;
            while chars.len() - start > max_chars {
                segments.push(chars[start..start + max_chars].iter().collect());
                start += max_chars;
            }
            current = chars[start..].iter().collect();
            current_chars = chars.len() - start;
        } else if !current.is_empty() && current_chars + 1 + line_chars > max_chars {
            segments.push(std::mem::take(&mut current));
            current = line.to_string();
            current_chars = line_chars;
        } else if current.is_empty() {
            current = line.to_string();
            current_chars = line_chars;
        } else {
            current.push('\n');
            current.push_str(line);
            current_chars += 1 + line_chars;
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}
