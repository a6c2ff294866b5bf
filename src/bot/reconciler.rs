// src/bot/reconciler.rs - Polling loop, snapshot diffing and scheduled
// side effects

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::bot::commands::CommandRouter;
use crate::bot::dedup::EventDeduplicator;
use crate::bot::moderation::{room_action_for, warning_for, ModerationPolicy};
use crate::bot::outbox::Outbox;
use crate::bot::violations::ViolationLedger;
use crate::bot::BotControls;
use crate::config::BotConfig;
use crate::room::RoomClient;
use crate::types::{Decision, EventKind, HeartbeatRecord, RoomAction, RoomSnapshot, User};

/// Join attempts per round, with a fixed pause between attempts.
const JOIN_ATTEMPTS: u32 = 3;
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Pause between rejoin rounds while reconnecting.
const RECONNECT_PAUSE: Duration = Duration::from_secs(30);
/// Consecutive snapshot failures tolerated before reconnecting.
const MAX_FETCH_FAILURES: u32 = 3;

const KEEP_ALIVE_MESSAGE: &str = "/me 保持活跃...";
const HANG_ROOM_MESSAGE: &str = "/me 挂房测试信息";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    Joining,
    Monitoring,
    Reconnecting,
    Stopped,
}

/// The single-threaded loop at the center of the bot: joins the room, polls
/// snapshots, diffs users and events, and routes every new message through
/// moderation and command dispatch. All per-poll mutable state (seen events,
/// welcomed users, rate windows) is owned here; background tasks only ever
/// write to the outbox.
pub struct PollingReconciler {
    config: BotConfig,
    room: Arc<dyn RoomClient>,
    router: Arc<CommandRouter>,
    policy: ModerationPolicy,
    ledger: Arc<ViolationLedger>,
    controls: Arc<BotControls>,
    roster: Arc<RwLock<HashMap<String, String>>>,
    outbox: Outbox,
    shutdown: watch::Receiver<bool>,

    state: ReconcilerState,
    dedup: EventDeduplicator,
    /// User ids greeted this process lifetime. Not persisted; a restart
    /// greets the whole room again.
    welcomed: HashSet<String>,
    known_users: HashSet<String>,
    consecutive_fetch_failures: u32,

    last_keep_alive: DateTime<Utc>,
    last_hang_room: DateTime<Utc>,
    last_auto_play: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

enum JoinRound {
    Joined,
    Failed,
    Shutdown,
}

impl PollingReconciler {
    pub fn new(
        config: BotConfig,
        room: Arc<dyn RoomClient>,
        router: Arc<CommandRouter>,
        policy: ModerationPolicy,
        ledger: Arc<ViolationLedger>,
        controls: Arc<BotControls>,
        roster: Arc<RwLock<HashMap<String, String>>>,
        outbox: Outbox,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Utc::now();
        Self {
            config,
            room,
            router,
            policy,
            ledger,
            controls,
            roster,
            outbox,
            shutdown,
            state: ReconcilerState::Idle,
            dedup: EventDeduplicator::new(),
            welcomed: HashSet::new(),
            known_users: HashSet::new(),
            consecutive_fetch_failures: 0,
            last_keep_alive: now,
            // Hang and auto-play fire on the first eligible tick.
            last_hang_room: DateTime::<Utc>::UNIX_EPOCH,
            last_auto_play: DateTime::<Utc>::UNIX_EPOCH,
            last_heartbeat: now,
        }
    }

    pub fn state(&self) -> ReconcilerState {
        self.state
    }

    /// Run until shutdown. Failing to join the room at startup is the one
    /// fatal error; everything after that degrades and retries.
    pub async fn run(&mut self) -> Result<()> {
        self.state = ReconcilerState::Joining;
        match self.join_round().await {
            JoinRound::Joined => {}
            JoinRound::Shutdown => {
                self.stop().await;
                return Ok(());
            }
            JoinRound::Failed => {
                self.state = ReconcilerState::Stopped;
                return Err(anyhow::anyhow!(
                    "Failed to join room {} after {} attempts",
                    self.config.room_id,
                    JOIN_ATTEMPTS
                ));
            }
        }

        self.outbox.say(self.config.online_message.clone()).await;
        self.write_heartbeat(true).await;
        self.state = ReconcilerState::Monitoring;
        info!(
            "Monitoring room {} every {}s",
            self.config.room_id, self.config.schedule.poll_interval_seconds
        );

        let mut ticker = interval(Duration::from_secs(
            self.config.schedule.poll_interval_seconds,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if !self.tick(Utc::now()).await {
                        break;
                    }
                }
            }
            if *self.shutdown.borrow() {
                break;
            }
        }

        self.stop().await;
        Ok(())
    }

    /// One poll cycle. Returns `false` when shutdown was requested while the
    /// cycle was reconnecting or waiting.
    async fn tick(&mut self, now: DateTime<Utc>) -> bool {
        let schedule = &self.config.schedule;

        if self.due(self.last_keep_alive, schedule.keep_alive_interval_seconds, now) {
            self.outbox.say(KEEP_ALIVE_MESSAGE).await;
            self.last_keep_alive = now;
        }

        if self.controls.hang_room_enabled.load(Ordering::Relaxed)
            && self.due(self.last_hang_room, schedule.hang_room_interval_seconds, now)
        {
            self.outbox.say(HANG_ROOM_MESSAGE).await;
            self.last_hang_room = now;
        }

        if self.controls.auto_play_enabled.load(Ordering::Relaxed)
            && self.due(self.last_auto_play, schedule.auto_play_interval_seconds, now)
            && self.router.try_auto_play().await
        {
            self.last_auto_play = now;
        }

        if self.due(self.last_heartbeat, schedule.heartbeat_interval_seconds, now) {
            self.write_heartbeat(true).await;
            self.last_heartbeat = now;
        }

        match self.room.room_snapshot(&self.config.room_id).await {
            Ok(snapshot) => {
                self.consecutive_fetch_failures = 0;
                self.process_snapshot(snapshot, now).await
            }
            Err(e) => {
                self.consecutive_fetch_failures += 1;
                warn!(
                    "Snapshot fetch failed ({} consecutive): {:#}",
                    self.consecutive_fetch_failures, e
                );
                if self.consecutive_fetch_failures >= MAX_FETCH_FAILURES {
                    self.reconnect().await
                } else {
                    true
                }
            }
        }
    }

    /// Diff one snapshot against accumulated state: greet newly observed
    /// users, then feed each genuinely new message through moderation and,
    /// when allowed, command dispatch.
    pub(crate) async fn process_snapshot(
        &mut self,
        snapshot: RoomSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        let bot_present = snapshot
            .users
            .iter()
            .any(|u| u.name == self.config.bot_name);
        if !bot_present {
            warn!(
                "Bot '{}' is absent from the user list, rejoining",
                self.config.bot_name
            );
            return self.reconnect().await;
        }

        {
            let mut roster = self.roster.write().await;
            for user in &snapshot.users {
                roster.insert(user.name.clone(), user.id.clone());
            }
        }

        for user in &snapshot.users {
            if user.name == self.config.bot_name {
                continue;
            }
            if self.known_users.insert(user.id.clone()) && self.welcomed.insert(user.id.clone()) {
                info!("Welcoming new user {}", user.name);
                self.outbox
                    .say(format!("/me ようこそ {}！お疲れ様です！", user.name))
                    .await;
            }
        }

        let fresh = self.dedup.filter_new(snapshot.events);
        for event in fresh {
            if event.kind != EventKind::Message {
                continue;
            }
            // The bot's own replies come back through the feed; it neither
            // moderates nor commands itself.
            if event.sender.name == self.config.bot_name {
                continue;
            }

            let decision = match self.policy.evaluate(&event.sender, &event.body, now).await {
                Ok(decision) => decision,
                Err(e) => {
                    error!("Moderation evaluation failed: {:#}", e);
                    continue;
                }
            };

            if decision == Decision::Allow {
                if let Err(e) = self.router.dispatch(&event.sender, &event.body).await {
                    error!("Command dispatch failed: {:#}", e);
                }
            } else {
                self.apply_sanctions(&event.sender, &decision).await;
            }
        }

        true
    }

    /// Schedule the (delayed, randomized) warning reply and apply the room
    /// action the violation count calls for. Warning tasks are fire-and
    /// -forget: once scheduled they deliver regardless of later state.
    async fn apply_sanctions(&self, user: &User, decision: &Decision) {
        if let Some((text, delay_range)) = warning_for(decision, &user.name) {
            let delay = rand::rng().random_range(delay_range);
            debug!("Scheduling warning for {} in {}s", user.name, delay);
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(delay)).await;
                outbox.say(text).await;
            });
        }

        if !self.controls.ai_manage_enabled.load(Ordering::Relaxed) {
            return;
        }

        let count = decision.violation_count().unwrap_or(0);
        match room_action_for(count) {
            RoomAction::Kick => {
                info!("Kicking {} after {} violations", user.name, count);
                match self.room.kick_user(&user.id).await {
                    Ok(()) => {
                        self.outbox
                            .say(format!("用户 {} 已被管理员踢出房间", user.name))
                            .await;
                    }
                    Err(e) => error!("Failed to kick {}: {:#}", user.name, e),
                }
            }
            RoomAction::Ban => {
                info!("Banning {} after {} violations", user.name, count);
                match self.room.ban_user(&user.id).await {
                    Ok(()) => {
                        self.outbox
                            .say(format!("用户 {} 已被管理员封禁", user.name))
                            .await;
                    }
                    Err(e) => error!("Failed to ban {}: {:#}", user.name, e),
                }
            }
            RoomAction::None => {}
        }
    }

    /// Rejoin until it works or shutdown is requested. Event and welcome
    /// state carries over, so nobody is greeted twice after a reconnect.
    async fn reconnect(&mut self) -> bool {
        self.state = ReconcilerState::Reconnecting;
        loop {
            match self.join_round().await {
                JoinRound::Joined => {
                    self.consecutive_fetch_failures = 0;
                    self.state = ReconcilerState::Monitoring;
                    self.write_heartbeat(true).await;
                    return true;
                }
                JoinRound::Shutdown => return false,
                JoinRound::Failed => {
                    warn!(
                        "Rejoin round failed, pausing {}s before the next round",
                        RECONNECT_PAUSE.as_secs()
                    );
                    if !self.wait_or_shutdown(RECONNECT_PAUSE).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn join_round(&mut self) -> JoinRound {
        for attempt in 1..=JOIN_ATTEMPTS {
            if *self.shutdown.borrow() {
                return JoinRound::Shutdown;
            }
            match self.room.join_room(&self.config.room_id).await {
                Ok(_) => {
                    info!("Joined room {}", self.config.room_id);
                    return JoinRound::Joined;
                }
                Err(e) => {
                    warn!(
                        "Join attempt {}/{} failed: {:#}",
                        attempt, JOIN_ATTEMPTS, e
                    );
                }
            }
            if attempt < JOIN_ATTEMPTS && !self.wait_or_shutdown(JOIN_RETRY_DELAY).await {
                return JoinRound::Shutdown;
            }
        }
        JoinRound::Failed
    }

    async fn wait_or_shutdown(&mut self, duration: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = sleep(duration) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
        !*self.shutdown.borrow()
    }

    fn due(&self, last: DateTime<Utc>, interval_seconds: i64, now: DateTime<Utc>) -> bool {
        now - last >= chrono::Duration::seconds(interval_seconds)
    }

    /// Heartbeat failures are logged and ignored; losing a beat only risks a
    /// watchdog restart, losing the loop would be worse.
    async fn write_heartbeat(&self, connected: bool) {
        let record = HeartbeatRecord {
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
            room_id: self.config.room_id.clone(),
            is_connected: connected,
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize heartbeat: {}", e);
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.config.schedule.heartbeat_file, json).await {
            error!(
                "Failed to write heartbeat {}: {}",
                self.config.schedule.heartbeat_file, e
            );
        }
    }

    async fn stop(&mut self) {
        self.state = ReconcilerState::Stopped;
        info!("Reconciler stopping, flushing durable state");
        if let Err(e) = self.ledger.flush().await {
            error!("Failed to flush violation ledger: {:#}", e);
        }
        self.write_heartbeat(false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::outbox;
    use crate::bot::playlist::Playlist;
    use crate::bot::testing::{RecordingRoom, StubAi, StubMusic, StubTts};
    use crate::providers::{AiProvider, MusicProvider, TtsProvider};
    use crate::types::RoomEvent;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    fn t(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn snapshot(users: &[(&str, &str)], events: &[(&str, &str, &str, i64)]) -> RoomSnapshot {
        RoomSnapshot {
            users: users.iter().map(|(id, name)| User::new(*id, *name)).collect(),
            events: events
                .iter()
                .map(|(id, name, body, ts)| RoomEvent {
                    kind: EventKind::Message,
                    sender: User::new(*id, *name),
                    body: body.to_string(),
                    timestamp: *ts,
                })
                .collect(),
        }
    }

    struct Fixture {
        reconciler: PollingReconciler,
        room: Arc<RecordingRoom>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        fixture_with(BotConfig::default(), RecordingRoom::new(), 0).await
    }

    async fn fixture_with(
        mut config: BotConfig,
        room: RecordingRoom,
        preseeded_violations: u32,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        config.moderation.violations_file = dir
            .path()
            .join("violations.json")
            .to_string_lossy()
            .into_owned();
        config.schedule.heartbeat_file = dir
            .path()
            .join("heartbeat.json")
            .to_string_lossy()
            .into_owned();

        let room = Arc::new(room);
        let ledger = Arc::new(ViolationLedger::load(&config.moderation.violations_file).await);
        for _ in 0..preseeded_violations {
            ledger.record_violation("noisy_u9").await.unwrap();
        }

        let controls = Arc::new(BotControls::from_config(&config));
        let playlist = Arc::new(Mutex::new(Playlist::new()));
        let roster = Arc::new(RwLock::new(HashMap::new()));
        let (outbox, _worker) = outbox::spawn(room.clone() as Arc<dyn RoomClient>);

        let router = Arc::new(CommandRouter::new(
            config.admin_name.clone(),
            Arc::clone(&controls),
            playlist,
            Arc::clone(&roster),
            outbox.clone(),
            room.clone() as Arc<dyn RoomClient>,
            Arc::new(StubAi::replying("ok")) as Arc<dyn AiProvider>,
            Arc::new(StubMusic::empty()) as Arc<dyn MusicProvider>,
            Arc::new(StubMusic::empty()) as Arc<dyn MusicProvider>,
            Arc::new(StubTts::empty()) as Arc<dyn TtsProvider>,
        ));

        let policy = ModerationPolicy::new(&config.moderation, &config.admin_name, Arc::clone(&ledger));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reconciler = PollingReconciler::new(
            config,
            room.clone() as Arc<dyn RoomClient>,
            router,
            policy,
            ledger,
            controls,
            roster,
            outbox,
            shutdown_rx,
        );

        Fixture {
            reconciler,
            room,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    async fn settle() {
        sleep(Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn welcomes_each_user_exactly_once() {
        let mut f = fixture().await;
        let first = snapshot(&[("b0", "AI机器人"), ("u1", "alice")], &[]);

        assert!(f.reconciler.process_snapshot(first.clone(), t(0)).await);
        assert!(f.reconciler.process_snapshot(first, t(3)).await);
        let second = snapshot(
            &[("b0", "AI机器人"), ("u1", "alice"), ("u2", "bob")],
            &[],
        );
        assert!(f.reconciler.process_snapshot(second, t(6)).await);
        settle().await;

        let posts = f.room.messages();
        let alice: Vec<_> = posts.iter().filter(|m| m.contains("ようこそ alice")).collect();
        let bob: Vec<_> = posts.iter().filter(|m| m.contains("ようこそ bob")).collect();
        assert_eq!(alice.len(), 1);
        assert_eq!(bob.len(), 1);
        assert!(!posts.iter().any(|m| m.contains("ようこそ AI机器人")));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_snapshots_dispatch_a_command_once() {
        let mut f = fixture().await;
        let users = [("b0", "AI机器人"), ("u1", "alice")];
        let events = [("u1", "alice", "/playlist", 100)];

        f.reconciler.process_snapshot(snapshot(&users, &events), t(0)).await;
        f.reconciler.process_snapshot(snapshot(&users, &events), t(3)).await;
        settle().await;

        let replies: Vec<_> = f
            .room
            .messages()
            .into_iter()
            .filter(|m| m.contains("播放列表为空"))
            .collect();
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flagged_message_schedules_warning_and_kicks_at_five() {
        let mut f = fixture_with(BotConfig::default(), RecordingRoom::new(), 4).await;
        let users = [("b0", "AI机器人"), ("u9", "noisy")];
        let events = [("u9", "noisy", "来赌博吧", 100)];

        f.reconciler.process_snapshot(snapshot(&users, &events), t(0)).await;
        settle().await;

        assert_eq!(f.room.kicked(), vec!["u9".to_string()]);
        let posts = f.room.messages();
        assert!(posts.iter().any(|m| m.contains("用户 noisy 已被管理员踢出房间")));
        // The delayed warning still went out.
        assert!(posts
            .iter()
            .any(|m| m.contains("@noisy") && m.contains("包含不当内容") && m.contains("第5次")));
    }

    #[tokio::test(start_paused = true)]
    async fn third_violation_requests_a_ban() {
        let mut f = fixture_with(BotConfig::default(), RecordingRoom::new(), 2).await;
        let users = [("b0", "AI机器人"), ("u9", "noisy")];
        let events = [("u9", "noisy", "赌博网站了解一下", 100)];

        f.reconciler.process_snapshot(snapshot(&users, &events), t(0)).await;
        settle().await;

        assert_eq!(f.room.banned(), vec!["u9".to_string()]);
        assert!(f.room.kicked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn management_toggle_suppresses_room_actions_but_not_warnings() {
        let mut config = BotConfig::default();
        config.features.ai_manage_enabled = false;
        let mut f = fixture_with(config, RecordingRoom::new(), 4).await;
        let users = [("b0", "AI机器人"), ("u9", "noisy")];
        let events = [("u9", "noisy", "赌博", 100)];

        f.reconciler.process_snapshot(snapshot(&users, &events), t(0)).await;
        settle().await;

        assert!(f.room.kicked().is_empty());
        assert!(f
            .room
            .messages()
            .iter()
            .any(|m| m.contains("@noisy") && m.contains("包含不当内容")));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_bot_in_user_list_triggers_rejoin() {
        let mut f = fixture().await;
        let without_bot = snapshot(&[("u1", "alice")], &[]);

        assert!(f.reconciler.process_snapshot(without_bot, t(0)).await);
        assert_eq!(f.reconciler.state(), ReconcilerState::Monitoring);
        assert_eq!(f.room.join_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_join_retries_are_fatal_at_startup() {
        let mut f = fixture_with(BotConfig::default(), RecordingRoom::failing_joins(), 0).await;

        let result = f.reconciler.run().await;
        assert!(result.is_err());
        assert_eq!(f.reconciler.state(), ReconcilerState::Stopped);
        assert_eq!(f.room.join_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn admin_ai_round_trip_through_the_full_pipeline() {
        let mut f = fixture().await;
        let users = [("b0", "AI机器人"), ("a1", "52Hertz")];

        f.reconciler
            .process_snapshot(
                snapshot(&users, &[("a1", "52Hertz", "/ai on", 100)]),
                t(0),
            )
            .await;
        f.reconciler
            .process_snapshot(
                snapshot(
                    &users,
                    &[
                        ("a1", "52Hertz", "/ai on", 100),
                        ("a1", "52Hertz", "/ai 你好", 103),
                    ],
                ),
                t(3),
            )
            .await;
        settle().await;

        let posts = f.room.messages();
        assert!(posts.contains(&"AI对话功能已开启".to_string()));
        let answers: Vec<_> = posts.iter().filter(|m| m.contains("@52Hertz ok")).collect();
        assert_eq!(answers.len(), 1);
    }
}
