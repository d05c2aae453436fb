//! SDK 入口 - 配置、初始化与会话生命周期
//!
//! 功能包括：
//! - 配置层（数据目录、助手后端、去重窗口、自聊 seen 延迟、HTTP）
//! - SDK 初始化（打开本地缓存、装配事件系统与助手客户端）
//! - 会话打开/关闭（解析房间 → 订阅消息流 → 一次性已读补记）
//! - 整房删除与优雅停机

use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::assistant::AssistantClient;
use crate::cache::OfflineCache;
use crate::dedup::{Deduplicator, DEFAULT_DEDUP_WINDOW_MS};
use crate::entities::{DeliveryState, Message, Room, RoomKind};
use crate::error::{PairchatSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::receipt::DeliveryReceiptTracker;
use crate::room::RoomResolver;
use crate::seen::SeenMarker;
use crate::send::OptimisticWriter;
use crate::store::{DocRef, QueryFilter, RemoteStoreClient, ROOMS_COLLECTION, MAX_BATCH_SIZE, messages_collection};
use crate::stream::MessageStream;

/// 自聊 seen 补记的默认延迟（毫秒）
pub const DEFAULT_SELF_SEEN_DELAY_MS: u64 = 1000;

/// HTTP 客户端配置（助手后端）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(30),
        }
    }
}

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairchatConfig {
    /// 当前登录身份
    pub identity: String,
    /// 本地数据目录（sled 缓存落在其下）
    pub data_dir: PathBuf,
    /// 助手回复后端地址（未配置则助手会话发送报错）
    pub assistant_base_url: Option<String>,
    /// 去重窗口（毫秒）
    pub dedup_window_ms: i64,
    /// 自聊 seen 补记延迟（毫秒）
    pub self_seen_delay_ms: u64,
    /// HTTP 客户端配置
    pub http: HttpClientConfig,
    /// 调试模式（初始化 tracing 输出）
    pub debug_mode: bool,
}

impl PairchatConfig {
    pub fn new(identity: impl Into<String>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            identity: identity.into(),
            data_dir: data_dir.as_ref().to_path_buf(),
            assistant_base_url: None,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            self_seen_delay_ms: DEFAULT_SELF_SEEN_DELAY_MS,
            http: HttpClientConfig::default(),
            debug_mode: false,
        }
    }

    pub fn with_assistant_base_url(mut self, url: impl Into<String>) -> Self {
        self.assistant_base_url = Some(url.into());
        self
    }

    pub fn with_dedup_window_ms(mut self, window_ms: i64) -> Self {
        self.dedup_window_ms = window_ms;
        self
    }

    pub fn with_self_seen_delay_ms(mut self, delay_ms: u64) -> Self {
        self.self_seen_delay_ms = delay_ms;
        self
    }

    pub fn with_http(mut self, http: HttpClientConfig) -> Self {
        self.http = http;
        self
    }

    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }
}

/// Pairchat SDK 主结构
pub struct PairchatSDK {
    config: PairchatConfig,
    store: Arc<dyn RemoteStoreClient>,
    cache: Arc<OfflineCache>,
    events: EventManager,
    assistant: Option<Arc<AssistantClient>>,
    resolver: RoomResolver,
    snowflake: Arc<snowflake_me::Snowflake>,
    shutting_down: AtomicBool,
}

impl PairchatSDK {
    /// 初始化 SDK
    ///
    /// 打开本地缓存、装配事件系统与助手客户端。远端文档库以
    /// 协作者形式注入，SDK 不关心其具体实现。
    pub async fn initialize(
        config: PairchatConfig,
        store: Arc<dyn RemoteStoreClient>,
    ) -> Result<Arc<Self>> {
        if config.identity.is_empty() {
            return Err(PairchatSDKError::Config("identity 不能为空".to_string()));
        }

        if config.debug_mode {
            // 重复初始化不报错（测试里多个 SDK 实例共存）
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .try_init();
        }

        let cache = Arc::new(OfflineCache::open(&config.data_dir).await?);

        let assistant = match &config.assistant_base_url {
            Some(url) => Some(Arc::new(AssistantClient::new(&config.http, url.clone())?)),
            None => None,
        };

        // 机器号随机：客户端 SDK 没有稳定的机器标识，临时 ID 只需
        // 本地唯一
        let mut rng = rand::rngs::StdRng::from_entropy();
        let machine_id: u16 = rng.gen_range(0..32);
        let data_center_id: u16 = rng.gen_range(0..32);
        let snowflake = snowflake_me::Snowflake::builder()
            .machine_id(&move || Ok(machine_id))
            .data_center_id(&move || Ok(data_center_id))
            .finalize()
            .map_err(|e| PairchatSDKError::Config(format!("初始化 ID 生成器失败: {:?}", e)))?;

        let resolver = RoomResolver::new(store.clone());

        info!("✅ SDK 初始化完成: identity={}", config.identity);
        Ok(Arc::new(Self {
            config,
            store,
            cache,
            events: EventManager::default(),
            assistant,
            resolver,
            snowflake: Arc::new(snowflake),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// 当前登录身份
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// 订阅 SDK 事件流
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SDKEvent> {
        self.events.subscribe()
    }

    /// 打开与某个身份的聊天（对方是自己则为自聊）
    pub async fn open_room(self: &Arc<Self>, other: &str) -> Result<ChatSession> {
        self.ensure_running()?;
        let identity = self.config.identity.clone();
        let room_id = self.resolver.get_or_create(&identity, other).await?;
        let kind = RoomKind::classify(&identity, other);
        let other_identity = match kind {
            RoomKind::Direct => Some(other.to_string()),
            RoomKind::SelfChat | RoomKind::Assistant => None,
        };
        self.open_session(room_id, kind, other_identity).await
    }

    /// 打开助手会话（按身份一人一间）
    pub async fn open_assistant(self: &Arc<Self>) -> Result<ChatSession> {
        self.ensure_running()?;
        let identity = self.config.identity.clone();
        let room_id = self.resolver.get_or_create_assistant(&identity).await?;
        self.open_session(room_id, RoomKind::Assistant, None).await
    }

    async fn open_session(
        self: &Arc<Self>,
        room_id: String,
        kind: RoomKind,
        other: Option<String>,
    ) -> Result<ChatSession> {
        let identity = self.config.identity.clone();

        let stream = MessageStream::open(
            self.store.clone(),
            self.cache.clone(),
            self.events.clone(),
            Deduplicator::with_window(self.config.dedup_window_ms),
            room_id.clone(),
            kind,
        )
        .await?;

        // 打开房间时恰好一次：批量补记对端消息已读并清零未读数
        SeenMarker::new(self.store.clone(), self.events.clone(), &identity)
            .mark_room(&room_id, kind, other.as_deref())
            .await;

        let writer = OptimisticWriter::new(
            self.store.clone(),
            self.assistant.clone(),
            self.events.clone(),
            self.snowflake.clone(),
            Duration::from_millis(self.config.self_seen_delay_ms),
            identity.clone(),
            other.clone(),
        );

        let tracker = DeliveryReceiptTracker::new(identity, kind, other);

        info!("💬 会话已打开: room={} ({})", room_id, kind);
        Ok(ChatSession {
            room_id,
            kind,
            stream,
            writer,
            tracker,
            events: self.events.clone(),
        })
    }

    /// 读取房间文档（会话列表等场景）
    pub async fn room(&self, room_id: &str) -> Result<Option<Room>> {
        match self.store.get(ROOMS_COLLECTION, room_id).await? {
            Some(doc) => Ok(Some(Room::from_doc(&doc)?)),
            None => Ok(None),
        }
    }

    /// 整房删除：房间文档与其全部消息一起删除
    ///
    /// 这是系统中唯一的删除形式，不支持单条消息删除同步。
    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.ensure_running()?;
        let collection = messages_collection(room_id);
        let docs = self
            .store
            .query(&collection, &QueryFilter::new(), "created_at")
            .await?;

        let total = docs.len();
        let refs: Vec<DocRef> = docs
            .iter()
            .map(|doc| DocRef::new(collection.clone(), &doc.id))
            .collect();
        for chunk in refs.chunks(MAX_BATCH_SIZE) {
            let deletions = chunk.iter().map(|doc_ref| self.store.delete(doc_ref));
            for result in futures::future::join_all(deletions).await {
                result?;
            }
        }

        self.store
            .delete(&DocRef::new(ROOMS_COLLECTION, room_id))
            .await?;
        if let Err(e) = self.cache.remove(room_id) {
            warn!("⚠️ 删除房间缓存失败: {}", e);
        }

        info!("🗑️ 整房删除完成: room={}, {} 条消息", room_id, total);
        Ok(())
    }

    /// 优雅停机：拒绝新会话并把缓存刷盘
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("重复停机调用，忽略");
            return Ok(());
        }
        self.cache.flush().await?;
        info!("📴 SDK 已停机: identity={}", self.config.identity);
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PairchatSDKError::ShuttingDown(
                "SDK 正在停机，拒绝新操作".to_string(),
            ));
        }
        Ok(())
    }
}

/// 打开的聊天会话
///
/// 持有消息流订阅、乐观发送器与回执跟踪器。`close()` 幂等；
/// Drop 时自动关闭。
pub struct ChatSession {
    room_id: String,
    kind: RoomKind,
    stream: Arc<MessageStream>,
    writer: OptimisticWriter,
    tracker: DeliveryReceiptTracker,
    events: EventManager,
}

impl ChatSession {
    /// 发送一条文本消息（乐观渲染，失败回滚）
    pub async fn send(&self, text: &str) -> Result<String> {
        self.writer.send(&self.stream, text).await
    }

    /// 当前渲染列表
    pub fn rendered(&self) -> Vec<Message> {
        self.stream.snapshot()
    }

    /// 订阅渲染列表更新（每次快照/本地变更推送完整列表）
    pub fn snapshots(&self) -> tokio::sync::broadcast::Receiver<Vec<Message>> {
        self.stream.subscribe_rendered()
    }

    /// 计算消息的对勾状态（只对自己发出的消息返回 Some）
    ///
    /// 状态推进时广播 MessageStatusChanged 事件；永不回退。
    pub fn receipt_state(&self, message: &Message) -> Option<DeliveryState> {
        let (state, changed) = self.tracker.advance(message)?;
        if changed {
            self.events.emit(SDKEvent::MessageStatusChanged {
                room_id: self.room_id.clone(),
                message_id: message.id.clone(),
                new_state: state,
                timestamp: crate::utils::time::now_millis(),
            });
        }
        Some(state)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_active()
    }

    /// 关闭会话（幂等）：取消订阅，清理回执高水位
    pub fn close(&self) {
        self.stream.close();
        self.tracker.forget_all();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}
