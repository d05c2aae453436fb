//! 已读标记器 - 打开房间时批量补记 seen
//!
//! 每次打开房间运行恰好一次（不随快照反复触发）：
//! - 私聊：对端发的、seen_by 还没有我的全部消息
//! - 自聊：seen_by 还没有我的全部消息（不分作者）
//! - 同一逻辑操作内把我的未读数清零，并修复房间冗余的
//!   last_message.seen_by
//!
//! 批量更新按存储的单批上限分块，整批失败只记日志：
//! 下次打开房间会重新补记，不阻塞本次打开。

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entities::{Message, RoomKind};
use crate::error::Result;
use crate::events::{EventManager, SDKEvent};
use crate::store::{
    messages_collection, DocPatch, DocRef, QueryFilter, RemoteStoreClient, MAX_BATCH_SIZE,
    ROOMS_COLLECTION,
};

/// 已读标记器
pub struct SeenMarker {
    store: Arc<dyn RemoteStoreClient>,
    events: EventManager,
    viewer: String,
}

impl SeenMarker {
    pub fn new(
        store: Arc<dyn RemoteStoreClient>,
        events: EventManager,
        viewer: impl Into<String>,
    ) -> Self {
        Self {
            store,
            events,
            viewer: viewer.into(),
        }
    }

    /// 打开房间时调用一次；整体尽力而为，失败不阻塞打开
    pub async fn mark_room(&self, room_id: &str, kind: RoomKind, other: Option<&str>) {
        if matches!(kind, RoomKind::Assistant) {
            // 助手会话的 seen 由回复后端维护
            debug!("助手会话跳过已读补记: {}", room_id);
            return;
        }

        match self.mark_room_inner(room_id, kind, other).await {
            Ok(marked) => {
                info!("✅ 已读补记完成: room={}, {} 条", room_id, marked);
                self.events.emit(SDKEvent::SeenMarked {
                    room_id: room_id.to_string(),
                    marked_count: marked,
                });
                self.events.emit(SDKEvent::UnreadCountChanged {
                    room_id: room_id.to_string(),
                    identity: self.viewer.clone(),
                    count: 0,
                });
            }
            Err(e) => {
                // 下次打开房间会重试，不上抛
                warn!("⚠️ 已读补记失败（下次打开重试）: room={}, {}", room_id, e);
            }
        }
    }

    async fn mark_room_inner(
        &self,
        room_id: &str,
        kind: RoomKind,
        other: Option<&str>,
    ) -> Result<usize> {
        let collection = messages_collection(room_id);
        let docs = self
            .store
            .query(&collection, &QueryFilter::new(), "created_at")
            .await?;

        let mut pending: Vec<String> = Vec::new();
        for doc in &docs {
            let message = match Message::from_doc(doc) {
                Ok(m) => m,
                Err(e) => {
                    warn!("⚠️ 跳过无法解析的消息文档 {}: {}", doc.id, e);
                    continue;
                }
            };
            if message.is_seen_by(&self.viewer) {
                continue;
            }
            // 私聊只补记对端发的；自聊不分作者
            let qualifies = match kind {
                RoomKind::SelfChat => true,
                RoomKind::Direct => other.is_some_and(|o| message.sender_id == o),
                RoomKind::Assistant => false,
            };
            if qualifies {
                pending.push(message.id.clone());
            }
        }

        let marked = pending.len();
        // 按单批上限分块，一千条未读也只是几个往返
        for chunk in pending.chunks(MAX_BATCH_SIZE) {
            let writes: Vec<(DocRef, DocPatch)> = chunk
                .iter()
                .map(|id| {
                    (
                        DocRef::new(collection.clone(), id),
                        DocPatch::new()
                            .with_set("seen", json!(true))
                            .with_array_union("seen_by", json!(self.viewer)),
                    )
                })
                .collect();
            self.store.batch_write(writes).await?;
        }

        self.reset_room_metadata(room_id, &docs).await?;
        Ok(marked)
    }

    /// 未读数清零 + 修复冗余的 last_message.seen_by
    async fn reset_room_metadata(
        &self,
        room_id: &str,
        message_docs: &[crate::store::Document],
    ) -> Result<()> {
        let mut patch = DocPatch::new().with_set(&format!("unread_count.{}", self.viewer), json!(0));

        // 尽力读取当前 last_message；缺失或畸形时回退到实际的
        // 最新消息文档重建，不让整个补记操作失败
        let room = self.store.get(ROOMS_COLLECTION, room_id).await?;
        let last_message_valid = room
            .as_ref()
            .map(|doc| {
                let lm = &doc.data["last_message"];
                lm.is_object() && lm["text"].is_string()
            })
            .unwrap_or(false);

        if last_message_valid {
            patch = patch.with_array_union("last_message.seen_by", json!(self.viewer));
        } else if let Some(latest) = message_docs.last() {
            match Message::from_doc(latest) {
                Ok(m) => {
                    let mut seen_by = m.seen_by.clone();
                    if !seen_by.iter().any(|s| s == &self.viewer) {
                        seen_by.push(self.viewer.clone());
                    }
                    debug!("🔧 重建畸形的 last_message: room={}", room_id);
                    patch = patch.with_set(
                        "last_message",
                        json!({
                            "text": m.text,
                            "sender_id": m.sender_id,
                            "created_at": m.created_at,
                            "seen_by": seen_by,
                        }),
                    );
                }
                Err(e) => warn!("⚠️ 最新消息文档无法解析，跳过 last_message 修复: {}", e),
            }
        }

        self.store
            .batch_write(vec![(DocRef::new(ROOMS_COLLECTION, room_id), patch)])
            .await
    }
}
