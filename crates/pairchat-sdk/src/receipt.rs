//! 投递回执跟踪器 - Sent / Delivered / Seen 状态机
//!
//! 按消息计算回执状态并驱动对勾渲染：
//! - Sent: 远端写入已确认
//! - Delivered: 消息已落入共享房间（落库即投递，不建模设备级握手）
//! - Seen: 目标身份出现在 seen_by 中（自聊为本人）
//!
//! 状态严格单向。每条消息维护高水位：即使某个迟到快照相对旧
//! （seen_by 暂时缺失），渲染状态也永不回退。

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::entities::{DeliveryState, Message, RoomKind};

/// 投递回执跟踪器（每个打开的房间一个实例）
pub struct DeliveryReceiptTracker {
    /// 当前身份（只为自己发出的消息渲染对勾）
    viewer: String,
    kind: RoomKind,
    /// Direct 房间的对端身份
    other: Option<String>,
    /// message_id -> 已渲染过的最高状态
    high_water: Mutex<HashMap<String, DeliveryState>>,
}

impl DeliveryReceiptTracker {
    pub fn new(viewer: impl Into<String>, kind: RoomKind, other: Option<String>) -> Self {
        Self {
            viewer: viewer.into(),
            kind,
            other,
            high_water: Mutex::new(HashMap::new()),
        }
    }

    /// 计算消息的渲染状态（只对自己发出的消息返回 Some）
    ///
    /// 返回 (状态, 是否相对上次推进)。迟到的旧快照不会使状态回退。
    pub fn advance(&self, message: &Message) -> Option<(DeliveryState, bool)> {
        if message.sender_id != self.viewer {
            return None;
        }

        let observed = self.observe(message);
        let mut high_water = self.high_water.lock();
        let entry = high_water
            .entry(message.id.clone())
            .or_insert(DeliveryState::Sent);

        if observed.precedence() > entry.precedence() {
            debug!(
                "✔️ 回执推进: message={} {} -> {}",
                message.id, entry, observed
            );
            *entry = observed;
            Some((observed, true))
        } else {
            Some((*entry, false))
        }
    }

    /// 只读查询当前渲染状态
    pub fn state_of(&self, message: &Message) -> Option<DeliveryState> {
        if message.sender_id != self.viewer {
            return None;
        }
        let observed = self.observe(message);
        let high_water = self.high_water.lock();
        let recorded = high_water
            .get(&message.id)
            .copied()
            .unwrap_or(DeliveryState::Sent);
        Some(if observed.precedence() > recorded.precedence() {
            observed
        } else {
            recorded
        })
    }

    /// 从快照内容观察状态：Seen 覆盖 Delivered，Delivered 覆盖 Sent
    fn observe(&self, message: &Message) -> DeliveryState {
        let seen = match self.kind {
            RoomKind::SelfChat => message.is_seen_by(&self.viewer),
            RoomKind::Direct => self
                .other
                .as_deref()
                .map(|o| message.is_seen_by(o))
                .unwrap_or(false),
            RoomKind::Assistant => message.seen,
        };
        if seen {
            DeliveryState::Seen
        } else if message.delivered {
            DeliveryState::Delivered
        } else {
            DeliveryState::Sent
        }
    }

    /// 消息被整房删除后清理高水位记录
    pub fn forget_all(&self) {
        self.high_water.lock().clear();
    }
}
