// src/bot/commands.rs - Slash-command parsing and dispatch

use anyhow::Result;
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;

use crate::bot::outbox::Outbox;
use crate::bot::playlist::Playlist;
use crate::bot::BotControls;
use crate::providers::{AiError, AiProvider, MusicProvider, TtsProvider};
use crate::room::RoomClient;
use crate::types::{PlaylistEntry, User};

/// AI chat calls get a few attempts before the requester sees a failure.
const AI_ATTEMPTS: u32 = 3;
const AI_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Every recognized slash command, produced by the single [`Command::parse`]
/// entry point and matched exhaustively in the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Admin(AdminCommand),
    /// `/ai <prompt>` from any user.
    AiChat(String),
    Music(MusicCommand),
    Info(InfoCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    AiOn,
    AiOff,
    AiManageOn,
    AiManageOff,
    AiModelShow,
    AiModelList,
    AiModelSet(String),
    HangOn,
    HangOff,
    Kick(String),
    Ban(String),
    Unban(String),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MusicCommand {
    /// `/play <title> <url>`; the raw argument text, validated on dispatch.
    Play(String),
    NetSearch(String),
    QqSearch(String),
    Tts(String),
    Next,
    List,
    Clear,
    /// `/music add|list|play`, kept for older room regulars.
    Legacy(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoCommand {
    Translate(String),
    Joke,
}

impl Command {
    /// Parse a message into a command. `is_admin` decides whether the
    /// admin-only forms exist at all: for everyone else `/ai on` is just an
    /// AI prompt and `/kick x` is ordinary chat that nothing handles.
    pub fn parse(text: &str, is_admin: bool) -> Option<Command> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }

        let (head, rest) = split_command(text);
        match head {
            "ai" => {
                if is_admin {
                    if let Some(cmd) = parse_admin_ai(rest) {
                        return Some(Command::Admin(cmd));
                    }
                }
                Some(Command::AiChat(rest.to_string()))
            }
            "hang" if is_admin => match rest {
                "on" => Some(Command::Admin(AdminCommand::HangOn)),
                "off" => Some(Command::Admin(AdminCommand::HangOff)),
                _ => None,
            },
            "kick" if is_admin => Some(Command::Admin(AdminCommand::Kick(rest.to_string()))),
            "ban" if is_admin => Some(Command::Admin(AdminCommand::Ban(rest.to_string()))),
            "unban" if is_admin => Some(Command::Admin(AdminCommand::Unban(rest.to_string()))),
            "help" if is_admin => Some(Command::Admin(AdminCommand::Help)),
            "play" => Some(Command::Music(MusicCommand::Play(rest.to_string()))),
            "netmusic" => Some(Command::Music(MusicCommand::NetSearch(rest.to_string()))),
            "qqmusic" => Some(Command::Music(MusicCommand::QqSearch(rest.to_string()))),
            "tts" => Some(Command::Music(MusicCommand::Tts(rest.to_string()))),
            "next" => Some(Command::Music(MusicCommand::Next)),
            "playlist" => Some(Command::Music(MusicCommand::List)),
            "clear" => Some(Command::Music(MusicCommand::Clear)),
            "music" => Some(Command::Music(MusicCommand::Legacy(rest.to_string()))),
            "translate" => Some(Command::Info(InfoCommand::Translate(rest.to_string()))),
            "joke" => Some(Command::Info(InfoCommand::Joke)),
            _ => None,
        }
    }
}

fn split_command(text: &str) -> (&str, &str) {
    let body = &text[1..];
    match body.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (body, ""),
    }
}

fn parse_admin_ai(rest: &str) -> Option<AdminCommand> {
    let mut tokens = rest.split_whitespace();
    match (tokens.next(), tokens.next(), tokens.next()) {
        (Some("on"), None, _) => Some(AdminCommand::AiOn),
        (Some("off"), None, _) => Some(AdminCommand::AiOff),
        (Some("manage"), Some("on"), None) => Some(AdminCommand::AiManageOn),
        (Some("manage"), Some("off"), None) => Some(AdminCommand::AiManageOff),
        (Some("model"), None, _) => Some(AdminCommand::AiModelShow),
        (Some("models"), None, _) => Some(AdminCommand::AiModelList),
        (Some("model"), Some(name), None) => Some(AdminCommand::AiModelSet(name.to_string())),
        _ => None,
    }
}

const HELP_TEXT: &str = "聊天室AI机器人 帮助信息:

AI功能命令（仅限管理员）:
/ai on - 开启AI功能
/ai off - 关闭AI功能
/ai <问题> - 与AI对话
/ai model - 查看当前AI模型
/ai models - 查看可用AI模型列表
/ai model <模型名> - 切换AI模型
/ai manage on - 开启AI房间管理功能
/ai manage off - 关闭AI房间管理功能

音乐点播命令（所有用户）:
/play <歌曲名> <链接> - 添加歌曲到播放列表
/netmusic <歌曲名> - 搜索网易云音乐
/qqmusic <歌曲名> - 搜索QQ音乐并直接输出链接
/tts <文本> - 将文本转换为语音并直接输出链接
/next - 播放下一首歌曲
/playlist - 查看播放列表
/clear - 清空播放列表

信息查询命令（所有用户）:
/joke - 随机段子
/translate <内容> - 翻译内容

系统命令（仅限管理员）:
/hang on - 开启挂房功能
/hang off - 关闭挂房功能
/kick <用户名> - 踢出指定用户
/ban <用户名> - 封禁指定用户
/unban <用户名> - 解封指定用户
/help - 显示帮助信息";

/// Dispatches parsed commands to their handlers. Shared by the polling loop
/// and its scheduled side effects; all replies go through the outbox.
pub struct CommandRouter {
    admin_name: String,
    controls: Arc<BotControls>,
    playlist: Arc<Mutex<Playlist>>,
    /// Display name -> user id, accumulated from every snapshot by the
    /// reconciler. Kick/ban targets are named by display name in chat but
    /// the service wants ids.
    roster: Arc<RwLock<HashMap<String, String>>>,
    outbox: Outbox,
    room: Arc<dyn RoomClient>,
    ai: Arc<dyn AiProvider>,
    netease: Arc<dyn MusicProvider>,
    qq: Arc<dyn MusicProvider>,
    tts: Arc<dyn TtsProvider>,
}

impl CommandRouter {
    pub fn new(
        admin_name: String,
        controls: Arc<BotControls>,
        playlist: Arc<Mutex<Playlist>>,
        roster: Arc<RwLock<HashMap<String, String>>>,
        outbox: Outbox,
        room: Arc<dyn RoomClient>,
        ai: Arc<dyn AiProvider>,
        netease: Arc<dyn MusicProvider>,
        qq: Arc<dyn MusicProvider>,
        tts: Arc<dyn TtsProvider>,
    ) -> Self {
        Self {
            admin_name,
            controls,
            playlist,
            roster,
            outbox,
            room,
            ai,
            netease,
            qq,
            tts,
        }
    }

    /// Try to handle `body` as a command. Returns `false` when the message
    /// carries no recognized command prefix and should be treated as
    /// ordinary chat; `true` whenever a reply was produced, including usage
    /// and error replies.
    pub async fn dispatch(&self, user: &User, body: &str) -> Result<bool> {
        let is_admin = user.name == self.admin_name;
        let Some(command) = Command::parse(body, is_admin) else {
            return Ok(false);
        };

        info!("Dispatching {:?} from {}", command, user.name);
        match command {
            Command::Admin(cmd) => self.handle_admin(cmd).await?,
            Command::AiChat(prompt) => self.handle_ai_chat(user, prompt, is_admin).await?,
            Command::Music(cmd) => self.handle_music(user, cmd).await?,
            Command::Info(cmd) => self.handle_info(user, cmd).await?,
        }
        Ok(true)
    }

    async fn handle_admin(&self, command: AdminCommand) -> Result<()> {
        match command {
            AdminCommand::AiOn => {
                self.controls.ai_enabled.store(true, Ordering::Relaxed);
                info!("AI chat enabled");
                self.outbox.say("AI对话功能已开启").await;
            }
            AdminCommand::AiOff => {
                self.controls.ai_enabled.store(false, Ordering::Relaxed);
                info!("AI chat disabled");
                self.outbox.say("AI对话功能已关闭").await;
            }
            AdminCommand::AiManageOn => {
                self.controls.ai_manage_enabled.store(true, Ordering::Relaxed);
                info!("Automatic room management enabled");
                self.outbox.say("AI房间管理功能已开启").await;
            }
            AdminCommand::AiManageOff => {
                self.controls.ai_manage_enabled.store(false, Ordering::Relaxed);
                info!("Automatic room management disabled");
                self.outbox.say("AI房间管理功能已关闭").await;
            }
            AdminCommand::AiModelShow => {
                let model = self.controls.ai_model.read().await.clone();
                self.outbox.say(format!("当前AI模型: {}", model)).await;
            }
            AdminCommand::AiModelList => {
                let models = self.controls.ai_models.join(", ");
                self.outbox.say(format!("可用AI模型: {}", models)).await;
            }
            AdminCommand::AiModelSet(name) => {
                if self.controls.ai_models.iter().any(|m| *m == name) {
                    *self.controls.ai_model.write().await = name.clone();
                    info!("AI model switched to {}", name);
                    self.outbox.say(format!("AI模型已切换为: {}", name)).await;
                } else {
                    let models = self.controls.ai_models.join(", ");
                    self.outbox
                        .say(format!("无效的AI模型: {}\n可用模型: {}", name, models))
                        .await;
                }
            }
            AdminCommand::HangOn => {
                self.controls.hang_room_enabled.store(true, Ordering::Relaxed);
                info!("Hang-room keepalive enabled");
                self.outbox.say("挂房功能已开启").await;
            }
            AdminCommand::HangOff => {
                self.controls.hang_room_enabled.store(false, Ordering::Relaxed);
                info!("Hang-room keepalive disabled");
                self.outbox.say("挂房功能已关闭").await;
            }
            AdminCommand::Kick(target) => {
                let resolved = self
                    .resolve_target(&target, "请提供要踢出的用户名: /kick <用户名>")
                    .await;
                if let Some((id, name)) = resolved {
                    match self.room.kick_user(&id).await {
                        Ok(()) => {
                            info!("Kicked {} ({})", name, id);
                            self.outbox.say(format!("已发送踢出用户 {} 的指令", name)).await;
                        }
                        Err(e) => {
                            error!("Failed to kick {}: {:#}", name, e);
                            self.outbox
                                .say(format!("踢出用户 {} 失败，请稍后再试", name))
                                .await;
                        }
                    }
                }
            }
            AdminCommand::Ban(target) => {
                let resolved = self
                    .resolve_target(&target, "请提供要封禁的用户名: /ban <用户名>")
                    .await;
                if let Some((id, name)) = resolved {
                    match self.room.ban_user(&id).await {
                        Ok(()) => {
                            info!("Banned {} ({})", name, id);
                            self.outbox.say(format!("已发送封禁用户 {} 的指令", name)).await;
                        }
                        Err(e) => {
                            error!("Failed to ban {}: {:#}", name, e);
                            self.outbox
                                .say(format!("封禁用户 {} 失败，请稍后再试", name))
                                .await;
                        }
                    }
                }
            }
            AdminCommand::Unban(target) => {
                let resolved = self
                    .resolve_target(&target, "请提供要解封的用户名: /unban <用户名>")
                    .await;
                if let Some((id, name)) = resolved {
                    match self.room.unban_user(&id, &name).await {
                        Ok(()) => {
                            info!("Unbanned {} ({})", name, id);
                            self.outbox.say(format!("已发送解封用户 {} 的指令", name)).await;
                        }
                        Err(e) => {
                            error!("Failed to unban {}: {:#}", name, e);
                            self.outbox
                                .say(format!("解封用户 {} 失败，请稍后再试", name))
                                .await;
                        }
                    }
                }
            }
            AdminCommand::Help => {
                self.outbox.say(HELP_TEXT).await;
            }
        }
        Ok(())
    }

    /// Resolve a kick/ban/unban target named by display name to the user id
    /// the service wants. Replies with usage or a not-found message and
    /// returns `None` when there is nothing to act on.
    async fn resolve_target(&self, target: &str, usage: &str) -> Option<(String, String)> {
        let target = target.trim();
        if target.is_empty() {
            self.outbox.say(usage).await;
            return None;
        }

        let id = self.roster.read().await.get(target).cloned();
        match id {
            Some(id) => Some((id, target.to_string())),
            None => {
                self.outbox.say(format!("未找到用户: {}", target)).await;
                None
            }
        }
    }

    async fn handle_ai_chat(&self, user: &User, prompt: String, is_admin: bool) -> Result<()> {
        if !self.controls.ai_enabled.load(Ordering::Relaxed) {
            if is_admin {
                self.outbox
                    .say("AI对话功能未开启，请使用 '/ai on' 命令开启")
                    .await;
            } else {
                self.outbox.say("AI对话功能未开启，请管理员先开启").await;
            }
            return Ok(());
        }

        let prompt = prompt.trim().to_string();
        if prompt.is_empty() {
            self.outbox.say("请输入要对话的内容").await;
            return Ok(());
        }

        self.outbox
            .say(format!("@{} 正在处理您的请求，请稍等...", user.name))
            .await;

        // The provider can take over a minute; never keep the polling loop
        // waiting for it.
        let ai = Arc::clone(&self.ai);
        let outbox = self.outbox.clone();
        let name = user.name.clone();
        tokio::spawn(async move {
            let text = match generate_with_retry(ai.as_ref(), &prompt).await {
                Ok(content) => content,
                Err(e) => ai_failure_text(&e),
            };
            outbox.say(format!("@{} {}", name, text)).await;
        });

        Ok(())
    }

    async fn handle_music(&self, user: &User, command: MusicCommand) -> Result<()> {
        match command {
            MusicCommand::Play(args) => self.queue_track(user, &args).await,
            MusicCommand::NetSearch(query) => {
                let query = query.trim();
                if query.is_empty() {
                    self.outbox.say("请提供要搜索的歌曲名: /netmusic <歌曲名>").await;
                    return Ok(());
                }
                self.outbox
                    .say(format!("@{} 正在搜索网易云音乐: {}", user.name, query))
                    .await;
                match self.netease.search(query).await {
                    Ok(track) => {
                        self.outbox
                            .say(format!(
                                "@{} 找到歌曲: {} - {}\n链接: {}\n请使用/play命令添加到播放列表",
                                user.name, track.title, track.artist, track.url
                            ))
                            .await;
                    }
                    Err(e) => {
                        warn!("Netease search for '{}' failed: {:#}", query, e);
                        self.outbox
                            .say(format!("@{} 抱歉，暂时无法搜索网易云音乐，请稍后再试。", user.name))
                            .await;
                    }
                }
            }
            MusicCommand::QqSearch(query) => {
                let query = query.trim();
                if query.is_empty() {
                    self.outbox.say("请提供要搜索的歌曲名: /qqmusic <歌曲名>").await;
                    return Ok(());
                }
                self.outbox
                    .say(format!("@{} 正在搜索QQ音乐: {}", user.name, query))
                    .await;
                match self.qq.search(query).await {
                    Ok(track) => {
                        self.outbox
                            .say(format!(
                                "@{} 找到歌曲: {} - {}\n歌曲链接: {}",
                                user.name, track.title, track.artist, track.url
                            ))
                            .await;
                    }
                    Err(e) => {
                        warn!("QQ music search for '{}' failed: {:#}", query, e);
                        self.outbox
                            .say(format!("@{} 抱歉，暂时无法搜索QQ音乐，请稍后再试。", user.name))
                            .await;
                    }
                }
            }
            MusicCommand::Tts(text) => {
                let text = text.trim();
                if text.is_empty() {
                    self.outbox.say("请提供要转换的文本: /tts <文本>").await;
                    return Ok(());
                }
                self.outbox
                    .say(format!("@{} 正在将文本转换为语音...", user.name))
                    .await;
                match self.tts.synthesize(text).await {
                    Ok(link) => {
                        self.outbox
                            .say(format!("@{} 文本转语音完成:\n{}", user.name, link))
                            .await;
                    }
                    Err(e) => {
                        warn!("TTS failed: {:#}", e);
                        self.outbox
                            .say(format!("@{} 文本转语音失败，请稍后再试", user.name))
                            .await;
                    }
                }
            }
            MusicCommand::Next => self.play_next().await,
            MusicCommand::List => self.list_playlist(user).await,
            MusicCommand::Clear => {
                self.playlist.lock().await.clear();
                info!("User {} cleared the playlist", user.name);
                self.outbox.say(format!("@{} 播放列表已清空", user.name)).await;
            }
            MusicCommand::Legacy(args) => {
                let args = args.trim();
                if let Some(url) = args.strip_prefix("add") {
                    let url = url.trim();
                    if !url.is_empty() {
                        self.playlist.lock().await.push(PlaylistEntry {
                            title: url.to_string(),
                            url: url.to_string(),
                        });
                        info!("User {} queued a raw link", user.name);
                        self.outbox.say(format!("@{} 已添加到播放列表", user.name)).await;
                        return Ok(());
                    }
                }
                match args {
                    "list" => self.list_playlist(user).await,
                    "play" => self.play_next().await,
                    _ => {
                        self.outbox
                            .say("请使用格式: /music add <链接> | /music list | /music play")
                            .await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn queue_track(&self, user: &User, args: &str) {
        let args = args.trim();
        match args.split_once(char::is_whitespace) {
            Some((title, url)) if !url.trim().is_empty() => {
                let entry = PlaylistEntry {
                    title: title.to_string(),
                    url: url.trim().to_string(),
                };
                info!("User {} queued '{}' ({})", user.name, entry.title, entry.url);
                self.playlist.lock().await.push(entry);
                self.outbox
                    .say(format!("@{} 已添加歌曲 '{}' 到播放列表", user.name, title))
                    .await;
            }
            _ => {
                self.outbox.say("请使用格式: /play <歌曲名> <链接>").await;
            }
        }
    }

    async fn list_playlist(&self, user: &User) {
        let playlist = self.playlist.lock().await;
        if playlist.is_empty() {
            self.outbox.say(format!("@{} 播放列表为空", user.name)).await;
            return;
        }
        let lines: Vec<String> = playlist
            .entries()
            .enumerate()
            .map(|(i, entry)| format!("{}. {}", i + 1, entry.title))
            .collect();
        drop(playlist);
        self.outbox
            .say(format!("@{} 当前播放列表:\n{}", user.name, lines.join("\n")))
            .await;
    }

    /// Pop and announce the next track; tells the room when there is none.
    pub async fn play_next(&self) {
        let entry = self.playlist.lock().await.pop_next();
        match entry {
            Some(entry) => {
                info!("Playing next track: {}", entry.title);
                self.outbox.say(format!("正在播放: {}", entry.title)).await;
                self.outbox.play(entry.title, entry.url).await;
            }
            None => self.outbox.say("播放列表为空").await,
        }
    }

    /// Autoplay variant: silently does nothing on an empty playlist so the
    /// idle room is not told about it every few minutes.
    pub async fn try_auto_play(&self) -> bool {
        let entry = self.playlist.lock().await.pop_next();
        let Some(entry) = entry else {
            return false;
        };
        info!("Auto-playing next track: {}", entry.title);
        self.outbox.say(format!("正在播放: {}", entry.title)).await;
        self.outbox.play(entry.title, entry.url).await;
        true
    }

    async fn handle_info(&self, user: &User, command: InfoCommand) -> Result<()> {
        match command {
            InfoCommand::Translate(text) => {
                let text = text.trim();
                if text.is_empty() {
                    self.outbox.say("请提供要翻译的内容: /translate <内容>").await;
                    return Ok(());
                }
                let prompt = format!(
                    "请翻译以下内容，中文译成英文，其他语言译成中文，只返回译文：{}",
                    text
                );
                self.spawn_info_reply(
                    user,
                    prompt,
                    "抱歉，暂时无法完成翻译，请稍后再试。",
                );
            }
            InfoCommand::Joke => {
                let prompt = "请给我讲一个简短的笑话，最好是中文的，适合在聊天室分享。".to_string();
                self.spawn_info_reply(user, prompt, "抱歉，暂时无法生成笑话，请稍后再试。");
            }
        }
        Ok(())
    }

    /// Single-attempt AI-backed reply for the info commands.
    fn spawn_info_reply(&self, user: &User, prompt: String, failure: &'static str) {
        let ai = Arc::clone(&self.ai);
        let outbox = self.outbox.clone();
        let name = user.name.clone();
        tokio::spawn(async move {
            match ai.generate(&prompt).await {
                Ok(text) => outbox.say(format!("@{} {}", name, text)).await,
                Err(e) => {
                    warn!("Info reply generation failed: {}", e);
                    outbox.say(format!("@{} {}", name, failure)).await;
                }
            }
        });
    }
}

async fn generate_with_retry(ai: &dyn AiProvider, prompt: &str) -> Result<String, AiError> {
    let mut last_error = AiError::EmptyResponse;

    for attempt in 1..=AI_ATTEMPTS {
        match ai.generate(prompt).await {
            Ok(content) => return Ok(content),
            Err(e) => {
                warn!("AI call attempt {}/{} failed: {}", attempt, AI_ATTEMPTS, e);
                last_error = e;
            }
        }
        if attempt < AI_ATTEMPTS {
            sleep(AI_RETRY_DELAY).await;
        }
    }

    Err(last_error)
}

/// The failure reply names the last failure class; never the raw error.
fn ai_failure_text(error: &AiError) -> String {
    match error {
        AiError::Timeout => "AI接口请求超时，请稍后再试".to_string(),
        AiError::Network(_) => "网络请求错误，请稍后再试".to_string(),
        AiError::EmptyResponse => "AI接口返回空内容，请稍后再试".to_string(),
        AiError::Malformed(_) => "AI接口响应格式错误，请稍后再试".to_string(),
        AiError::BadStatus(code) => status_failure_text(*code),
    }
}

fn status_failure_text(code: u16) -> String {
    match code {
        400 => "请求错误，请稍后再试".to_string(),
        403 => "请求被服务器拒绝，请稍后再试".to_string(),
        405 => "客户端请求的方法被禁止，请稍后再试".to_string(),
        408 => "请求时间过长，请稍后再试".to_string(),
        500 => "服务器内部出现错误，请稍后再试".to_string(),
        501 => "服务器不支持请求的功能，请稍后再试".to_string(),
        503 => "系统维护中，请稍后再试".to_string(),
        other => format!("AI接口调用失败，状态码: {}，请稍后再试", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::testing::{RecordingRoom, StubAi, StubMusic, StubTts};
    use crate::bot::{outbox, BotControls};
    use crate::config::BotConfig;
    use crate::providers::TrackInfo;

    fn admin() -> User {
        User::new("a1", "52Hertz")
    }

    fn visitor() -> User {
        User::new("u1", "ネコ")
    }

    // ------------------------------------------------------------------
    // Parser
    // ------------------------------------------------------------------

    #[test]
    fn parses_admin_forms_only_for_the_admin() {
        assert_eq!(
            Command::parse("/ai on", true),
            Some(Command::Admin(AdminCommand::AiOn))
        );
        // For anyone else the same text is an AI prompt.
        assert_eq!(
            Command::parse("/ai on", false),
            Some(Command::AiChat("on".to_string()))
        );

        assert_eq!(
            Command::parse("/kick ネコ", true),
            Some(Command::Admin(AdminCommand::Kick("ネコ".to_string())))
        );
        assert_eq!(Command::parse("/kick ネコ", false), None);
    }

    #[test]
    fn parses_ai_subcommands() {
        assert_eq!(
            Command::parse("/ai model R1", true),
            Some(Command::Admin(AdminCommand::AiModelSet("R1".to_string())))
        );
        assert_eq!(
            Command::parse("/ai models", true),
            Some(Command::Admin(AdminCommand::AiModelList))
        );
        assert_eq!(
            Command::parse("/ai manage off", true),
            Some(Command::Admin(AdminCommand::AiManageOff))
        );
        // A question that merely starts with an admin-looking word is chat.
        assert_eq!(
            Command::parse("/ai 你好", true),
            Some(Command::AiChat("你好".to_string()))
        );
    }

    #[test]
    fn playlist_is_not_swallowed_by_play() {
        assert_eq!(
            Command::parse("/playlist", false),
            Some(Command::Music(MusicCommand::List))
        );
        assert_eq!(
            Command::parse("/play 夜曲 http://x/y.mp3", false),
            Some(Command::Music(MusicCommand::Play(
                "夜曲 http://x/y.mp3".to_string()
            )))
        );
    }

    #[test]
    fn unknown_prefixes_and_plain_chat_are_not_commands() {
        assert_eq!(Command::parse("/frobnicate now", true), None);
        assert_eq!(Command::parse("just chatting", false), None);
        assert_eq!(Command::parse("/hang sideways", true), None);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    struct Fixture {
        router: CommandRouter,
        room: Arc<RecordingRoom>,
        ai: Arc<StubAi>,
        controls: Arc<BotControls>,
    }

    fn fixture_with_ai(ai: StubAi) -> Fixture {
        let config = BotConfig::default();
        let room = Arc::new(RecordingRoom::new());
        let controls = Arc::new(BotControls::from_config(&config));
        let ai = Arc::new(ai);
        let (outbox, _worker) = outbox::spawn(room.clone() as Arc<dyn RoomClient>);

        let roster = Arc::new(RwLock::new(HashMap::from([
            ("ネコ".to_string(), "u1".to_string()),
        ])));

        let router = CommandRouter::new(
            config.admin_name.clone(),
            Arc::clone(&controls),
            Arc::new(Mutex::new(Playlist::new())),
            roster,
            outbox,
            room.clone() as Arc<dyn RoomClient>,
            ai.clone() as Arc<dyn AiProvider>,
            Arc::new(StubMusic::with_track(TrackInfo {
                title: "海阔天空".to_string(),
                artist: "Beyond".to_string(),
                url: "http://music.example/htk.mp3".to_string(),
            })) as Arc<dyn MusicProvider>,
            Arc::new(StubMusic::with_track(TrackInfo {
                title: "晴天".to_string(),
                artist: "周杰伦".to_string(),
                url: "http://music.example/qt.mp3".to_string(),
            })) as Arc<dyn MusicProvider>,
            Arc::new(StubTts::with_link("http://tts.example/out.wav")) as Arc<dyn TtsProvider>,
        );

        Fixture {
            router,
            room,
            ai,
            controls,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_ai(StubAi::replying("你好呀"))
    }

    async fn settle() {
        // Paused clock: this fast-forwards through every pending sleep
        // (retry delays, segment delays) and lets spawned tasks finish.
        sleep(Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn ai_chat_end_to_end_success() {
        let f = fixture();

        assert!(f.router.dispatch(&admin(), "/ai on").await.unwrap());
        assert!(f.router.dispatch(&admin(), "/ai 你好").await.unwrap());
        settle().await;

        assert_eq!(f.ai.prompts(), vec!["你好".to_string()]);

        let posts = f.room.messages();
        assert!(posts.contains(&"AI对话功能已开启".to_string()));
        let answers: Vec<_> = posts.iter().filter(|m| m.contains("你好呀")).collect();
        assert_eq!(answers, vec![&"@52Hertz 你好呀".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn ai_chat_timeout_retries_three_times_then_reports_once() {
        let f = fixture_with_ai(StubAi::failing(AiError::Timeout));

        f.router.dispatch(&admin(), "/ai on").await.unwrap();
        f.router.dispatch(&admin(), "/ai 你好").await.unwrap();
        settle().await;

        assert_eq!(f.ai.prompts().len(), 3);

        let posts = f.room.messages();
        let failures: Vec<_> = posts
            .iter()
            .filter(|m| m.contains("AI接口请求超时"))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("@52Hertz "));
    }

    #[tokio::test(start_paused = true)]
    async fn ai_chat_while_disabled_makes_no_provider_call() {
        let f = fixture();

        assert!(f.router.dispatch(&visitor(), "/ai 在吗").await.unwrap());
        settle().await;

        assert!(f.ai.prompts().is_empty());
        assert!(f
            .room
            .messages()
            .contains(&"AI对话功能未开启，请管理员先开启".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn play_next_and_playlist_round_trip() {
        let f = fixture();
        let user = visitor();

        f.router
            .dispatch(&user, "/play 夜曲 http://x/y.mp3")
            .await
            .unwrap();
        f.router.dispatch(&user, "/playlist").await.unwrap();
        f.router.dispatch(&user, "/next").await.unwrap();
        f.router.dispatch(&user, "/playlist").await.unwrap();
        settle().await;

        let posts = f.room.messages();
        assert!(posts.iter().any(|m| m.contains("已添加歌曲 '夜曲'")));
        assert!(posts.iter().any(|m| m.contains("1. 夜曲")));
        assert!(posts.iter().any(|m| m.contains("正在播放: 夜曲")));
        assert!(posts.iter().any(|m| m.contains("播放列表为空")));

        assert_eq!(
            f.room.music_posts(),
            vec![("夜曲".to_string(), "http://x/y.mp3".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn play_without_url_gets_usage_reply() {
        let f = fixture();

        assert!(f.router.dispatch(&visitor(), "/play 夜曲").await.unwrap());
        settle().await;

        assert!(f
            .room
            .messages()
            .contains(&"请使用格式: /play <歌曲名> <链接>".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn qqmusic_reports_a_direct_link() {
        let f = fixture();

        f.router.dispatch(&visitor(), "/qqmusic 晴天").await.unwrap();
        settle().await;

        let posts = f.room.messages();
        assert!(posts
            .iter()
            .any(|m| m.contains("晴天 - 周杰伦") && m.contains("歌曲链接: http://music.example/qt.mp3")));
        // Direct-link search must not touch the playlist.
        f.router.dispatch(&visitor(), "/playlist").await.unwrap();
        settle().await;
        assert!(f.room.messages().iter().any(|m| m.contains("播放列表为空")));
    }

    #[tokio::test(start_paused = true)]
    async fn tts_reports_the_audio_link() {
        let f = fixture();

        f.router.dispatch(&visitor(), "/tts 早上好").await.unwrap();
        settle().await;

        assert!(f
            .room
            .messages()
            .iter()
            .any(|m| m.contains("文本转语音完成") && m.contains("http://tts.example/out.wav")));
    }

    #[tokio::test(start_paused = true)]
    async fn kick_resolves_the_target_through_the_roster() {
        let f = fixture();

        assert!(f.router.dispatch(&admin(), "/kick ネコ").await.unwrap());
        settle().await;

        assert_eq!(f.room.kicked(), vec!["u1".to_string()]);
        assert!(f
            .room
            .messages()
            .contains(&"已发送踢出用户 ネコ 的指令".to_string()));

        assert!(f.router.dispatch(&admin(), "/ban 无名氏").await.unwrap());
        settle().await;
        assert!(f.room.messages().contains(&"未找到用户: 无名氏".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_prefix_falls_through_as_ordinary_chat() {
        let f = fixture();

        assert!(!f.router.dispatch(&visitor(), "大家好").await.unwrap());
        assert!(!f.router.dispatch(&visitor(), "/blame").await.unwrap());
        // Admin-only commands from a visitor are silently ignored too.
        assert!(!f.router.dispatch(&visitor(), "/kick 52Hertz").await.unwrap());
        settle().await;

        assert!(f.room.messages().is_empty());
        assert!(f.room.kicked().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hang_toggle_flips_the_control_flag() {
        let f = fixture();
        assert!(f.controls.hang_room_enabled.load(Ordering::Relaxed));

        f.router.dispatch(&admin(), "/hang off").await.unwrap();
        settle().await;

        assert!(!f.controls.hang_room_enabled.load(Ordering::Relaxed));
        assert!(f.room.messages().contains(&"挂房功能已关闭".to_string()));
    }
}
