// src/bot/moderation.rs - Rate, repeat and keyword checks plus the combined
// accept/reject policy

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::info;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::bot::violations::ViolationLedger;
use crate::config::ModerationConfig;
use crate::types::{Decision, RoomAction, User};

/// Sliding-window message counter per user key. Every hit is recorded, even
/// while over the limit, so a user spamming through the limit keeps tripping
/// it until the window drains.
pub struct RateLimiter {
    windows: HashMap<String, Vec<DateTime<Utc>>>,
    message_limit: usize,
    time_window: Duration,
}

impl RateLimiter {
    pub fn new(message_limit: usize, time_window_seconds: i64) -> Self {
        Self {
            windows: HashMap::new(),
            message_limit,
            time_window: Duration::seconds(time_window_seconds),
        }
    }

    /// Prune the user's window, record this hit, and report whether the
    /// window is now over the limit.
    pub fn check_and_record(&mut self, user_key: &str, now: DateTime<Utc>) -> bool {
        let window = self.windows.entry(user_key.to_string()).or_default();
        window.retain(|ts| now - *ts < self.time_window);
        window.push(now);
        window.len() > self.message_limit
    }
}

/// Short-term history of message bodies per user key, flagging exact
/// repeats.
pub struct RepeatDetector {
    history: HashMap<String, Vec<(String, DateTime<Utc>)>>,
    repeat_limit: usize,
    window: Duration,
}

impl RepeatDetector {
    pub fn new(repeat_limit: usize, window_seconds: i64) -> Self {
        Self {
            history: HashMap::new(),
            repeat_limit,
            window: Duration::seconds(window_seconds),
        }
    }

    /// The count compared against the limit is taken before the current
    /// message is appended: with limit 3 the fourth identical send is the
    /// first one flagged.
    pub fn check_and_record(&mut self, user_key: &str, now: DateTime<Utc>, body: &str) -> bool {
        let entries = self.history.entry(user_key.to_string()).or_default();
        entries.retain(|(_, ts)| now - *ts < self.window);

        let prior_repeats = entries.iter().filter(|(b, _)| b == body).count();
        entries.push((body.to_string(), now));

        prior_repeats >= self.repeat_limit
    }
}

/// Stateless keyword classifier. Keywords match case-insensitively anywhere
/// in the body; the first match wins.
pub struct ContentFilter {
    keywords: Vec<String>,
}

impl ContentFilter {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn classify(&self, body: &str) -> Option<String> {
        let lowered = body.to_lowercase();
        self.keywords
            .iter()
            .find(|keyword| lowered.contains(keyword.as_str()))
            .map(|keyword| format!("包含不当关键词: {}", keyword))
    }
}

/// Combined moderation decision for one incoming message. Checks run in a
/// fixed order and the first failing check wins; at most one violation is
/// recorded per message.
pub struct ModerationPolicy {
    admin_name: String,
    rate: RateLimiter,
    repeats: RepeatDetector,
    filter: ContentFilter,
    ledger: Arc<ViolationLedger>,
}

impl ModerationPolicy {
    pub fn new(config: &ModerationConfig, admin_name: &str, ledger: Arc<ViolationLedger>) -> Self {
        Self {
            admin_name: admin_name.to_string(),
            rate: RateLimiter::new(config.message_limit, config.time_window_seconds),
            repeats: RepeatDetector::new(config.repeat_limit, config.repeat_window_seconds),
            filter: ContentFilter::new(&config.keywords),
            ledger,
        }
    }

    pub fn is_admin(&self, user: &User) -> bool {
        user.name == self.admin_name
    }

    pub async fn evaluate(
        &mut self,
        user: &User,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        // The admin bypasses everything; the checks are not even invoked so
        // no admin traffic is recorded in any window.
        if self.is_admin(user) {
            return Ok(Decision::Allow);
        }

        let key = user.moderation_key();

        if self.rate.check_and_record(&key, now) {
            let count = self.ledger.record_violation(&key).await?;
            info!("User {} is rate limited (violation #{})", user.name, count);
            return Ok(Decision::RateLimited { count });
        }

        if self.repeats.check_and_record(&key, now, body) {
            let count = self.ledger.record_violation(&key).await?;
            info!("User {} is repeating messages (violation #{})", user.name, count);
            return Ok(Decision::Repeating { count });
        }

        if let Some(reason) = self.filter.classify(body) {
            let count = self.ledger.record_violation(&key).await?;
            info!(
                "Message from {} flagged: {} (violation #{})",
                user.name, reason, count
            );
            return Ok(Decision::Flagged { reason, count });
        }

        Ok(Decision::Allow)
    }
}

/// Room action requested for a violation count: repeat offenders get banned,
/// persistent ones get kicked.
pub fn room_action_for(count: u32) -> RoomAction {
    if count >= 5 {
        RoomAction::Kick
    } else if count >= 3 {
        RoomAction::Ban
    } else {
        RoomAction::None
    }
}

/// Warning reply and delay range for a decision, or `None` when no warning
/// is sent. Rate-limit warnings go out quickly and only for the first two
/// violations (warning a flooder every time would add to the flood); repeat
/// and keyword warnings always go out, slower.
pub fn warning_for(decision: &Decision, user_name: &str) -> Option<(String, RangeInclusive<u64>)> {
    match decision {
        Decision::Allow => None,
        Decision::RateLimited { count } => {
            if *count <= 2 {
                Some((
                    format!(
                        "@{} 您发送消息过于频繁，请稍后再试。这是第{}次违规。",
                        user_name, count
                    ),
                    1..=3,
                ))
            } else {
                None
            }
        }
        Decision::Repeating { count } => Some((
            format!(
                "@{} 请勿重复发送相同消息。这是第{}次违规。",
                user_name, count
            ),
            5..=10,
        )),
        Decision::Flagged { count, .. } => Some((
            format!(
                "@{} 发送的消息包含不当内容，已被系统拦截。请遵守聊天室规则。这是第{}次违规。",
                user_name, count
            ),
            5..=10,
        )),
    }
}
