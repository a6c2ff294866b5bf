use anyhow::Result;
use log::{error, info};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

use crate::config::BotConfig;
use crate::providers::http::{HttpAiProvider, HttpMusicProvider, HttpTtsProvider};
use crate::providers::{AiProvider, MusicProvider, TtsProvider};
use crate::room::RoomClient;

pub mod commands;
pub mod dedup;
pub mod moderation;
pub mod outbox;
pub mod playlist;
pub mod reconciler;
pub mod violations;

use commands::CommandRouter;
use moderation::ModerationPolicy;
use playlist::Playlist;
use reconciler::PollingReconciler;
use violations::ViolationLedger;

/// Runtime-togglable switches, initialized from config and flipped by admin
/// commands. One explicit aggregate instead of loose flags scattered over
/// the bot.
pub struct BotControls {
    pub ai_enabled: AtomicBool,
    pub ai_manage_enabled: AtomicBool,
    pub hang_room_enabled: AtomicBool,
    pub auto_play_enabled: AtomicBool,
    pub ai_models: Vec<String>,
    pub ai_model: RwLock<String>,
}

impl BotControls {
    pub fn from_config(config: &BotConfig) -> Self {
        Self {
            ai_enabled: AtomicBool::new(config.features.ai_enabled),
            ai_manage_enabled: AtomicBool::new(config.features.ai_manage_enabled),
            hang_room_enabled: AtomicBool::new(config.features.hang_room_enabled),
            auto_play_enabled: AtomicBool::new(config.features.auto_play_enabled),
            ai_models: config.providers.ai_models.clone(),
            ai_model: RwLock::new(config.providers.default_ai_model.clone()),
        }
    }
}

/// The external provider capabilities the command handlers call out to.
pub struct Providers {
    pub ai: Arc<dyn AiProvider>,
    pub netease: Arc<dyn MusicProvider>,
    pub qq: Arc<dyn MusicProvider>,
    pub tts: Arc<dyn TtsProvider>,
}

impl Providers {
    /// Build the HTTP-backed provider set from config.
    pub fn from_config(config: &BotConfig) -> Result<Self> {
        Ok(Self {
            ai: Arc::new(HttpAiProvider::new(config.providers.ai_api_url.clone())?),
            netease: Arc::new(HttpMusicProvider::new(
                config.providers.netease_music_api_url.clone(),
            )?),
            qq: Arc::new(HttpMusicProvider::new(
                config.providers.qq_music_api_url.clone(),
            )?),
            tts: Arc::new(HttpTtsProvider::new(
                config.providers.tts_api_url.clone(),
                config.providers.tts_voice.clone(),
            )?),
        })
    }
}

/// Bound on draining queued replies after the loop stops.
const OUTBOX_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// The assembled bot: wires the moderation pipeline, command router,
/// outbox and polling reconciler together and runs until shutdown.
pub struct RoomBot {
    config: BotConfig,
    room: Arc<dyn RoomClient>,
    providers: Providers,
}

impl RoomBot {
    pub fn new(config: BotConfig, room: Arc<dyn RoomClient>, providers: Providers) -> Self {
        Self {
            config,
            room,
            providers,
        }
    }

    /// Run until the shutdown signal flips to `true`. Returns an error only
    /// for fatal startup failures (the room could not be joined at all).
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let RoomBot {
            config,
            room,
            providers,
        } = self;

        info!(
            "Starting {} v{} for room {}",
            config.bot_name,
            crate::VERSION,
            config.room_id
        );

        let ledger = Arc::new(ViolationLedger::load(&config.moderation.violations_file).await);
        let controls = Arc::new(BotControls::from_config(&config));
        let playlist = Arc::new(Mutex::new(Playlist::new()));
        let roster = Arc::new(RwLock::new(HashMap::new()));
        let (outbox, outbox_worker) = outbox::spawn(Arc::clone(&room));

        let router = Arc::new(CommandRouter::new(
            config.admin_name.clone(),
            Arc::clone(&controls),
            playlist,
            Arc::clone(&roster),
            outbox.clone(),
            Arc::clone(&room),
            Arc::clone(&providers.ai),
            Arc::clone(&providers.netease),
            Arc::clone(&providers.qq),
            Arc::clone(&providers.tts),
        ));

        let policy = ModerationPolicy::new(&config.moderation, &config.admin_name, Arc::clone(&ledger));

        let mut reconciler = PollingReconciler::new(
            config,
            Arc::clone(&room),
            router,
            policy,
            ledger,
            controls,
            roster,
            outbox,
            shutdown,
        );

        let result = reconciler.run().await;

        // Release every outbox handle so the worker can drain and exit;
        // in-flight AI tasks may hold clones for a little longer.
        drop(reconciler);
        match tokio::time::timeout(OUTBOX_DRAIN_TIMEOUT, outbox_worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Outbox worker failed: {}", e),
            Err(_) => error!(
                "Outbox did not drain within {}s, abandoning queued replies",
                OUTBOX_DRAIN_TIMEOUT.as_secs()
            ),
        }

        info!("Bot stopped");
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::providers::{AiError, AiProvider, MusicProvider, TrackInfo, TtsProvider};
    use crate::room::RoomClient;
    use crate::types::RoomSnapshot;

    /// RoomClient double recording every call it receives.
    pub struct RecordingRoom {
        posted: Mutex<Vec<String>>,
        music: Mutex<Vec<(String, String)>>,
        kicked: Mutex<Vec<String>>,
        banned: Mutex<Vec<String>>,
        unbanned: Mutex<Vec<(String, String)>>,
        join_calls: AtomicUsize,
        fail_joins: bool,
    }

    impl RecordingRoom {
        pub fn new() -> Self {
            Self {
                posted: Mutex::new(Vec::new()),
                music: Mutex::new(Vec::new()),
                kicked: Mutex::new(Vec::new()),
                banned: Mutex::new(Vec::new()),
                unbanned: Mutex::new(Vec::new()),
                join_calls: AtomicUsize::new(0),
                fail_joins: false,
            }
        }

        /// A room that refuses every join attempt.
        pub fn failing_joins() -> Self {
            Self {
                fail_joins: true,
                ..Self::new()
            }
        }

        pub fn messages(&self) -> Vec<String> {
            self.posted.lock().unwrap().clone()
        }

        pub fn music_posts(&self) -> Vec<(String, String)> {
            self.music.lock().unwrap().clone()
        }

        pub fn kicked(&self) -> Vec<String> {
            self.kicked.lock().unwrap().clone()
        }

        pub fn banned(&self) -> Vec<String> {
            self.banned.lock().unwrap().clone()
        }

        pub fn unbanned(&self) -> Vec<(String, String)> {
            self.unbanned.lock().unwrap().clone()
        }

        pub fn join_calls(&self) -> usize {
            self.join_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RoomClient for RecordingRoom {
        async fn join_room(&self, _room_id: &str) -> Result<RoomSnapshot> {
            self.join_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_joins {
                return Err(anyhow::anyhow!("join refused"));
            }
            Ok(RoomSnapshot::default())
        }

        async fn room_snapshot(&self, _room_id: &str) -> Result<RoomSnapshot> {
            Err(anyhow::anyhow!("no snapshot queued"))
        }

        async fn post_message(
            &self,
            text: &str,
            _url: Option<&str>,
            _to: Option<&str>,
        ) -> Result<()> {
            self.posted.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn post_music(&self, title: &str, url: &str) -> Result<()> {
            self.music
                .lock()
                .unwrap()
                .push((title.to_string(), url.to_string()));
            Ok(())
        }

        async fn kick_user(&self, user_id: &str) -> Result<()> {
            self.kicked.lock().unwrap().push(user_id.to_string());
            Ok(())
        }

        async fn ban_user(&self, user_id: &str) -> Result<()> {
            self.banned.lock().unwrap().push(user_id.to_string());
            Ok(())
        }

        async fn unban_user(&self, user_id: &str, user_name: &str) -> Result<()> {
            self.unbanned
                .lock()
                .unwrap()
                .push((user_id.to_string(), user_name.to_string()));
            Ok(())
        }

        async fn leave_room(&self) -> Result<()> {
            Ok(())
        }
    }

    /// AiProvider double with a fixed outcome, recording prompts.
    pub struct StubAi {
        reply: Result<String, AiError>,
        prompts: Mutex<Vec<String>>,
    }

    impl StubAi {
        pub fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(error: AiError) -> Self {
            Self {
                reply: Err(error),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AiProvider for StubAi {
        async fn generate(&self, prompt: &str) -> Result<String, AiError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply.clone()
        }
    }

    pub struct StubMusic {
        track: Option<TrackInfo>,
    }

    impl StubMusic {
        pub fn with_track(track: TrackInfo) -> Self {
            Self { track: Some(track) }
        }

        pub fn empty() -> Self {
            Self { track: None }
        }
    }

    #[async_trait]
    impl MusicProvider for StubMusic {
        async fn search(&self, _query: &str) -> Result<TrackInfo> {
            self.track
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no track found"))
        }
    }

    pub struct StubTts {
        link: Option<String>,
    }

    impl StubTts {
        pub fn with_link(link: &str) -> Self {
            Self {
                link: Some(link.to_string()),
            }
        }

        pub fn empty() -> Self {
            Self { link: None }
        }
    }

    #[async_trait]
    impl TtsProvider for StubTts {
        async fn synthesize(&self, _text: &str) -> Result<String> {
            self.link
                .clone()
                .ok_or_else(|| anyhow::anyhow!("synthesis unavailable"))
        }
    }
}
