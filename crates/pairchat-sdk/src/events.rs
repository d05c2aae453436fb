//! 事件系统模块 - 统一的事件广播与订阅
//!
//! 功能包括：
//! - 渲染列表更新事件
//! - 回执状态推进事件
//! - 发送失败事件（乐观回滚后恰好一次）
//! - 未读数变更事件

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::entities::DeliveryState;

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 新快照已应用到渲染列表
    SnapshotApplied {
        room_id: String,
        message_count: usize,
    },
    /// 回执状态推进（永不回退）
    MessageStatusChanged {
        room_id: String,
        message_id: String,
        new_state: DeliveryState,
        timestamp: i64,
    },
    /// 发送失败（临时条目已回滚，不自动重试）
    ///
    /// 携带原始文本，UI 可据此把内容放回输入框供重发。
    SendFailed {
        room_id: String,
        local_message_id: String,
        text: String,
        reason: String,
        timestamp: i64,
    },
    /// 未读数变更
    UnreadCountChanged {
        room_id: String,
        identity: String,
        count: i64,
    },
    /// 批量已读标记完成
    SeenMarked {
        room_id: String,
        marked_count: usize,
    },
}

/// 事件管理器
#[derive(Clone)]
pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
}

impl EventManager {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    /// 广播事件（无订阅者时静默丢弃）
    pub fn emit(&self, event: SDKEvent) {
        debug!("📣 事件: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let manager = EventManager::new(16);
        let mut rx = manager.subscribe();

        manager.emit(SDKEvent::SeenMarked {
            room_id: "r1".to_string(),
            marked_count: 3,
        });

        match rx.recv().await.unwrap() {
            SDKEvent::SeenMarked { room_id, marked_count } => {
                assert_eq!(room_id, "r1");
                assert_eq!(marked_count, 3);
            }
            other => panic!("收到意外事件: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let manager = EventManager::new(16);
        // 没有订阅者也不报错
        manager.emit(SDKEvent::SnapshotApplied {
            room_id: "r1".to_string(),
            message_count: 0,
        });
    }
}
