//! 消息流 - 实时订阅生命周期与快照合并管道
//!
//! 每个打开的房间持有一个 MessageStream：
//! - 订阅消息子集合（按 created_at 升序）
//! - 每个快照**整表替换**内存视图（正确性优先于微观效率，
//!   单房间消息量受 UI 滚动历史约束）
//! - 助手会话：空快照走离线缓存回退渲染，非空快照写透缓存
//! - 合并存活的本地临时条目后交给去重器，广播渲染列表
//!
//! 订阅在视图关闭时恰好取消一次；所有迟到回调在改状态前都要过
//! "仍然活跃"检查。

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::OfflineCache;
use crate::dedup::Deduplicator;
use crate::entities::{Message, RoomKind};
use crate::error::Result;
use crate::events::{EventManager, SDKEvent};
use crate::store::{messages_collection, Document, QueryFilter, RemoteStoreClient, SubscriptionGuard};

/// 渲染列表广播缓冲
const RENDERED_CHANNEL_SIZE: usize = 64;

/// 消息流
pub struct MessageStream {
    room_id: String,
    kind: RoomKind,
    cache: Arc<OfflineCache>,
    dedup: Deduplicator,
    events: EventManager,
    /// 最近一次已应用的确认快照
    confirmed: RwLock<Vec<Message>>,
    /// 存活的本地临时条目
    provisional: RwLock<Vec<Message>>,
    /// 当前渲染列表
    rendered: RwLock<Vec<Message>>,
    rendered_tx: broadcast::Sender<Vec<Message>>,
    /// 活跃守卫：关闭后所有迟到回调都不得再改状态
    active: Arc<AtomicBool>,
    guard: Mutex<Option<SubscriptionGuard>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageStream {
    /// 打开房间的消息流：订阅并启动快照消费任务
    pub async fn open(
        store: Arc<dyn RemoteStoreClient>,
        cache: Arc<OfflineCache>,
        events: EventManager,
        dedup: Deduplicator,
        room_id: String,
        kind: RoomKind,
    ) -> Result<Arc<Self>> {
        let subscription = store
            .subscribe(&messages_collection(&room_id), QueryFilter::new(), "created_at")
            .await?;

        let (rendered_tx, _) = broadcast::channel(RENDERED_CHANNEL_SIZE);
        let stream = Arc::new(Self {
            room_id: room_id.clone(),
            kind,
            cache,
            dedup,
            events,
            confirmed: RwLock::new(Vec::new()),
            provisional: RwLock::new(Vec::new()),
            rendered: RwLock::new(Vec::new()),
            rendered_tx,
            active: Arc::new(AtomicBool::new(true)),
            guard: Mutex::new(Some(subscription.guard)),
            task: Mutex::new(None),
        });

        let consumer = stream.clone();
        let active = stream.active.clone();
        let mut receiver = subscription.receiver;
        let task = tokio::spawn(async move {
            while let Some(docs) = receiver.recv().await {
                // 迟到快照在视图关闭后直接丢弃
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                consumer.apply_snapshot(docs);
            }
            debug!("📪 快照消费任务退出: room={}", consumer.room_id);
        });
        *stream.task.lock() = Some(task);

        info!("📡 消息流已打开: room={} ({})", room_id, kind);
        Ok(stream)
    }

    /// 应用一个实时快照（整表替换）
    fn apply_snapshot(&self, docs: Vec<Document>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let mut messages = Vec::with_capacity(docs.len());
        for doc in &docs {
            match Message::from_doc(doc) {
                Ok(m) => messages.push(m),
                Err(e) => warn!("⚠️ 跳过无法解析的消息文档 {}: {}", doc.id, e),
            }
        }

        match self.kind {
            RoomKind::Assistant => {
                if messages.is_empty() {
                    // 空的实时结果不是错误：读缓存渲染
                    match self.cache.read_fallback(&self.room_id) {
                        Ok(Some(cached)) => {
                            info!(
                                "💾 实时查询为空，渲染缓存: room={}, {} 条",
                                self.room_id,
                                cached.len()
                            );
                            messages = cached;
                        }
                        Ok(None) => {}
                        Err(e) => warn!("⚠️ 缓存回退读取失败: {}", e),
                    }
                } else if let Err(e) = self.cache.write_through(&self.room_id, &messages) {
                    warn!("⚠️ 缓存写透失败: {}", e);
                }
            }
            RoomKind::SelfChat | RoomKind::Direct => {}
        }

        *self.confirmed.write() = messages;
        self.render();
    }

    /// 追加本地临时条目（乐观发送路径）
    pub fn push_provisional(&self, message: Message) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        self.provisional.write().push(message);
        self.render();
    }

    /// 移除本地临时条目（发送失败回滚）
    pub fn remove_provisional(&self, local_id: &str) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        let removed = {
            let mut provisional = self.provisional.write();
            let before = provisional.len();
            provisional.retain(|m| m.id != local_id);
            provisional.len() < before
        };
        if removed {
            self.render();
        }
        removed
    }

    /// 重建渲染列表并广播
    fn render(&self) {
        let confirmed = self.confirmed.read().clone();

        // 确认副本已到达的临时条目永久折叠
        let confirmed_keys: HashSet<_> = confirmed.iter().map(|m| self.dedup.key_of(m)).collect();
        {
            let mut provisional = self.provisional.write();
            provisional.retain(|m| !confirmed_keys.contains(&self.dedup.key_of(m)));
        }

        let mut merged = confirmed;
        merged.extend(self.provisional.read().iter().cloned());
        // 相对顺序只由 created_at 决定，与快照到达顺序无关
        merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let rendered = self.dedup.collapse(merged);
        *self.rendered.write() = rendered.clone();

        self.events.emit(SDKEvent::SnapshotApplied {
            room_id: self.room_id.clone(),
            message_count: rendered.len(),
        });
        let _ = self.rendered_tx.send(rendered);
    }

    /// 当前渲染列表
    pub fn snapshot(&self) -> Vec<Message> {
        self.rendered.read().clone()
    }

    /// 订阅渲染列表更新
    pub fn subscribe_rendered(&self) -> broadcast::Receiver<Vec<Message>> {
        self.rendered_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 活跃标记（供定时器等迟到回调做检查）
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    /// 关闭消息流（幂等）：取消订阅恰好一次
    pub fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(mut guard) = self.guard.lock().take() {
                guard.cancel();
            }
            info!("📴 消息流已关闭: room={}", self.room_id);
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.close();
    }
}
