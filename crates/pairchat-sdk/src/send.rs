//! 乐观发送器 - 先渲染后落库，失败回滚
//!
//! 发送路径：
//! 1. 合成本地临时消息（雪花 ID）并立即追加到渲染列表，
//!    调用方永远不会为视觉反馈等待网络
//! 2. 发起远端追加（助手会话改为 POST 回复后端，由后端落库）
//! 3. 成功后无需显式替换：下一个快照带回确认副本，
//!    去重器把临时条目折叠掉
//! 4. 失败时显式移除临时条目，并广播恰好一次 SendFailed 事件；
//!    不静默丢消息，不自动重试
//! 5. 私聊房间额外更新房间冗余字段（last_message + 对端未读数
//!    原子自增，永不读-改-写，双向并发发送不丢计数）
//! 6. 自聊：落库后立即强制 delivered，固定短延迟后补记 seen
//!    （"自己看见了发给自己的消息"，无需第二个参与者）

use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::assistant::AssistantClient;
use crate::entities::{Message, RoomKind};
use crate::error::{PairchatSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::store::{
    messages_collection, DocPatch, DocRef, RemoteStoreClient, ROOMS_COLLECTION, SERVER_TIMESTAMP,
};
use crate::stream::MessageStream;
use crate::utils::time::now_millis;

/// 乐观发送器（每个打开的房间一个实例）
pub struct OptimisticWriter {
    store: Arc<dyn RemoteStoreClient>,
    assistant: Option<Arc<AssistantClient>>,
    events: EventManager,
    snowflake: Arc<snowflake_me::Snowflake>,
    /// 自聊补记 seen 的延迟（可配置，默认 1 秒）
    self_seen_delay: Duration,
    sender_id: String,
    /// Direct 房间的对端身份
    other: Option<String>,
}

impl OptimisticWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn RemoteStoreClient>,
        assistant: Option<Arc<AssistantClient>>,
        events: EventManager,
        snowflake: Arc<snowflake_me::Snowflake>,
        self_seen_delay: Duration,
        sender_id: impl Into<String>,
        other: Option<String>,
    ) -> Self {
        Self {
            store,
            assistant,
            events,
            snowflake,
            self_seen_delay,
            sender_id: sender_id.into(),
            other,
        }
    }

    /// 发送一条文本消息
    ///
    /// 调用方应在调用本方法前清空输入框；失败时 SendFailed 事件
    /// 携带原文本，UI 可据此恢复内容供重发。
    pub async fn send(&self, stream: &Arc<MessageStream>, text: &str) -> Result<String> {
        let room_id = stream.room_id().to_string();
        let kind = stream.kind();

        // 本地雪花算法生成临时 ID，仅用于回滚匹配，永不落库
        let local_id = format!(
            "local_{}",
            self.snowflake
                .next_id()
                .map_err(|e| PairchatSDKError::Other(format!("生成临时消息 ID 失败: {:?}", e)))?
        );

        let provisional = Message {
            id: local_id.clone(),
            room_id: room_id.clone(),
            text: text.to_string(),
            sender_id: self.sender_id.clone(),
            // 客户端时钟只做占位，确认后以服务端时间戳为准
            created_at: now_millis(),
            seen_by: Vec::new(),
            delivered: matches!(kind, RoomKind::SelfChat),
            seen: false,
            provisional: true,
        };
        stream.push_provisional(provisional);
        debug!("📝 临时消息已渲染: {} ({})", local_id, kind);

        let append_result = self.append_remote(&room_id, kind, text).await;

        match append_result {
            Ok(server_id) => {
                match kind {
                    RoomKind::Direct => {
                        self.update_room_metadata(&room_id, text).await;
                    }
                    RoomKind::SelfChat => {
                        if let Some(id) = &server_id {
                            self.schedule_self_seen(stream, &room_id, id);
                        }
                    }
                    RoomKind::Assistant => {
                        // 后端负责落库来信与回复，客户端只等快照
                    }
                }
                info!("✅ 消息发送成功: room={}, local_id={}", room_id, local_id);
                Ok(server_id.unwrap_or(local_id))
            }
            Err(e) => {
                // 显式回滚，恰好一次用户可见错误
                stream.remove_provisional(&local_id);
                warn!("❌ 消息发送失败，已回滚临时条目: {} ({})", local_id, e);
                self.events.emit(SDKEvent::SendFailed {
                    room_id,
                    local_message_id: local_id,
                    text: text.to_string(),
                    reason: e.to_string(),
                    timestamp: now_millis(),
                });
                Err(PairchatSDKError::SendFailed(e.to_string()))
            }
        }
    }

    /// 远端追加；返回服务端消息 ID（助手路径由后端落库，无 ID）
    async fn append_remote(
        &self,
        room_id: &str,
        kind: RoomKind,
        text: &str,
    ) -> Result<Option<String>> {
        match kind {
            RoomKind::SelfChat | RoomKind::Direct => {
                let data = json!({
                    "room_id": room_id,
                    "text": text,
                    "sender_id": self.sender_id,
                    "created_at": SERVER_TIMESTAMP,
                    "seen_by": [],
                    // 落入共享房间即投递
                    "delivered": true,
                    "seen": false,
                });
                let id = self
                    .store
                    .create(&messages_collection(room_id), None, data)
                    .await?;
                Ok(Some(id))
            }
            RoomKind::Assistant => {
                let assistant = self.assistant.as_ref().ok_or_else(|| {
                    PairchatSDKError::Config("未配置助手后端地址".to_string())
                })?;
                assistant.ask(&self.sender_id, text).await?;
                Ok(None)
            }
        }
    }

    /// 私聊房间的冗余字段更新：last_message 覆盖 + 对端未读数原子自增
    ///
    /// 与消息写入不在同一事务内，短暂不一致允许存在，下次读取自愈。
    /// 失败只记日志：消息本身已发送成功。
    async fn update_room_metadata(&self, room_id: &str, text: &str) {
        let Some(other) = self.other.as_deref() else {
            warn!("⚠️ Direct 房间缺少对端身份，跳过元数据更新: {}", room_id);
            return;
        };

        let patch = DocPatch::new()
            .with_set(
                "last_message",
                json!({
                    "text": text,
                    "sender_id": self.sender_id,
                    "created_at": SERVER_TIMESTAMP,
                    "seen_by": [self.sender_id],
                }),
            )
            .with_increment(&format!("unread_count.{}", other), 1);

        if let Err(e) = self
            .store
            .batch_write(vec![(DocRef::new(ROOMS_COLLECTION, room_id), patch)])
            .await
        {
            warn!("⚠️ 房间元数据更新失败（将自愈）: room={}, {}", room_id, e);
        }
    }

    /// 自聊：固定延迟后补记 seen（迟到回调过活跃检查）
    fn schedule_self_seen(&self, stream: &Arc<MessageStream>, room_id: &str, message_id: &str) {
        let store = self.store.clone();
        let active = stream.active_flag();
        let delay = self.self_seen_delay;
        let sender = self.sender_id.clone();
        let doc_ref = DocRef::new(messages_collection(room_id), message_id);
        let room_id = room_id.to_string();

        tokio::spawn(async move {
            sleep(delay).await;
            // 视图已关闭则放弃，定时器不得在拆除后改状态
            if !active.load(Ordering::SeqCst) {
                debug!("⏲️ 自聊 seen 定时器触发时视图已关闭，忽略: {}", room_id);
                return;
            }
            let patch = DocPatch::new()
                .with_set("seen", json!(true))
                .with_array_union("seen_by", json!(sender));
            if let Err(e) = store.batch_write(vec![(doc_ref, patch)]).await {
                warn!("⚠️ 自聊 seen 补记失败: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OfflineCache;
    use crate::dedup::Deduplicator;
    use crate::store::{MemoryStore, QueryFilter};
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn test_snowflake() -> Arc<snowflake_me::Snowflake> {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let machine_id: u16 = rng.gen_range(0..32);
        let data_center_id: u16 = rng.gen_range(0..32);
        Arc::new(
            snowflake_me::Snowflake::builder()
                .machine_id(&move || Ok(machine_id))
                .data_center_id(&move || Ok(data_center_id))
                .finalize()
                .expect("初始化 Snowflake 失败"),
        )
    }

    async fn open_stream(
        store: Arc<MemoryStore>,
        events: EventManager,
        room_id: &str,
        kind: RoomKind,
    ) -> (Arc<MessageStream>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = Arc::new(OfflineCache::open(temp_dir.path()).await.unwrap());
        let stream = MessageStream::open(
            store,
            cache,
            events,
            Deduplicator::new(),
            room_id.to_string(),
            kind,
        )
        .await
        .unwrap();
        (stream, temp_dir)
    }

    async fn wait_for<F: Fn(&[Message]) -> bool>(stream: &MessageStream, pred: F) -> Vec<Message> {
        for _ in 0..100 {
            let snap = stream.snapshot();
            if pred(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("等待渲染列表超时: {:?}", stream.snapshot());
    }

    #[tokio::test]
    async fn test_direct_send_updates_metadata() {
        let store = Arc::new(MemoryStore::new());
        let events = EventManager::default();
        store
            .create("rooms", Some("r1"), json!({"participants": ["u1", "u2"], "unread_count": {"u1": 0, "u2": 0}}))
            .await
            .unwrap();
        let (stream, _tmp) = open_stream(store.clone(), events.clone(), "r1", RoomKind::Direct).await;

        let writer = OptimisticWriter::new(
            store.clone(),
            None,
            events,
            test_snowflake(),
            Duration::from_millis(50),
            "u1",
            Some("u2".to_string()),
        );

        writer.send(&stream, "hi").await.unwrap();

        // 确认副本到达，临时条目折叠
        let snap = wait_for(&stream, |s| s.len() == 1 && !s[0].provisional).await;
        assert!(snap[0].delivered);

        // 冗余字段：last_message + 对端未读数
        let room = store.get("rooms", "r1").await.unwrap().unwrap();
        assert_eq!(room.data["last_message"]["text"], "hi");
        assert_eq!(room.data["unread_count"]["u2"], 1);
        assert_eq!(room.data["unread_count"]["u1"], 0);
    }

    #[tokio::test]
    async fn test_send_failure_rolls_back_with_single_event() {
        let store = Arc::new(MemoryStore::new());
        let events = EventManager::default();
        let mut event_rx = events.subscribe();
        let (stream, _tmp) = open_stream(store.clone(), events.clone(), "r1", RoomKind::Direct).await;

        let writer = OptimisticWriter::new(
            store.clone(),
            None,
            events,
            test_snowflake(),
            Duration::from_millis(50),
            "u1",
            Some("u2".to_string()),
        );

        store.fail_next_create();
        let err = writer.send(&stream, "会失败").await;
        assert!(err.is_err());

        // 临时条目已回滚，不留半截消息
        assert!(stream.snapshot().is_empty());

        // 恰好一次 SendFailed，且携带原文本
        let mut send_failed = 0;
        while let Ok(event) = event_rx.try_recv() {
            if let SDKEvent::SendFailed { text, .. } = event {
                assert_eq!(text, "会失败");
                send_failed += 1;
            }
        }
        assert_eq!(send_failed, 1);
    }

    #[tokio::test]
    async fn test_self_chat_delivered_then_seen_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let events = EventManager::default();
        let (stream, _tmp) = open_stream(store.clone(), events.clone(), "self_r", RoomKind::SelfChat).await;

        let writer = OptimisticWriter::new(
            store.clone(),
            None,
            events,
            test_snowflake(),
            Duration::from_millis(50),
            "u1",
            None,
        );

        writer.send(&stream, "note to self").await.unwrap();

        // 落库即 delivered
        let snap = wait_for(&stream, |s| s.len() == 1 && s[0].delivered).await;
        assert!(!snap[0].is_seen_by("u1"));

        // 固定延迟后补记 seen，无需第二个参与者
        let snap = wait_for(&stream, |s| s.len() == 1 && s[0].is_seen_by("u1")).await;
        assert!(snap[0].seen);
    }

    #[tokio::test]
    async fn test_self_seen_timer_ignored_after_close() {
        let store = Arc::new(MemoryStore::new());
        let events = EventManager::default();
        let (stream, _tmp) = open_stream(store.clone(), events.clone(), "self_r", RoomKind::SelfChat).await;

        let writer = OptimisticWriter::new(
            store.clone(),
            None,
            events,
            test_snowflake(),
            Duration::from_millis(50),
            "u1",
            None,
        );

        writer.send(&stream, "note").await.unwrap();
        // 定时器触发前关闭视图
        stream.close();
        tokio::time::sleep(Duration::from_millis(120)).await;

        // seen 补记被活跃检查拦下
        let docs = store
            .query(&messages_collection("self_r"), &QueryFilter::new(), "created_at")
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].data["seen"], false);
    }

    #[tokio::test]
    async fn test_assistant_without_backend_is_config_error() {
        let store = Arc::new(MemoryStore::new());
        let events = EventManager::default();
        let (stream, _tmp) =
            open_stream(store.clone(), events.clone(), "session_u1", RoomKind::Assistant).await;

        let writer = OptimisticWriter::new(
            store.clone(),
            None, // 未配置助手后端
            events,
            test_snowflake(),
            Duration::from_millis(50),
            "u1",
            None,
        );

        assert!(writer.send(&stream, "你好").await.is_err());
        // 回滚后渲染列表为空
        assert!(stream.snapshot().is_empty());
    }
}
