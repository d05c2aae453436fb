//! 数据实体定义 - 对应远端文档结构
//!
//! 这里定义了远端文档库中的房间/消息文档对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示
//! - 序列化/反序列化支持
//!
//! 所有实体都只是远端状态的投影：客户端内存副本永远不是权威数据，
//! 必须收敛到下一个快照的内容。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{PairchatSDKError, Result};
use crate::store::Document;

/// 房间类型
///
/// 取代散落在各组件里的布尔标记（自聊？助手？），
/// 所有分支都通过穷尽匹配消费。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKind {
    /// 自聊（参与者集合大小为 1）
    SelfChat,
    /// 双人私聊
    Direct,
    /// 助手会话（按身份划分的会话房间，后端可能暂时不可用）
    Assistant,
}

impl RoomKind {
    /// 根据参与者推断房间类型（助手房间不走此路径，由调用方显式指定）
    pub fn classify(current: &str, other: &str) -> Self {
        if current == other {
            RoomKind::SelfChat
        } else {
            RoomKind::Direct
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            RoomKind::SelfChat => "自聊",
            RoomKind::Direct => "私聊",
            RoomKind::Assistant => "助手会话",
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// 消息实体 - 对应 rooms/{room_id}/messages 下的文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 文档 ID（远端分配；确认前为本地雪花算法生成的临时 ID）
    #[serde(default)]
    pub id: String,
    /// 所属房间 ID
    pub room_id: String,
    /// 消息文本
    pub text: String,
    /// 发送方身份
    pub sender_id: String,
    /// 服务端提交时分配的 UTC 毫秒时间戳，排序的唯一依据
    pub created_at: i64,
    /// 已读身份集合（只增不减）
    #[serde(default)]
    pub seen_by: Vec<String>,
    /// 是否已投递（单调 false -> true）
    #[serde(default)]
    pub delivered: bool,
    /// 是否已读
    #[serde(default)]
    pub seen: bool,
    /// 是否为未确认的本地临时条目
    #[serde(default)]
    pub provisional: bool,
}

impl Message {
    /// 从远端文档解析消息
    pub fn from_doc(doc: &Document) -> Result<Self> {
        let mut message: Message = serde_json::from_value(doc.data.clone())
            .map_err(|e| PairchatSDKError::InvalidData(format!("解析消息文档失败: {}", e)))?;
        message.id = doc.id.clone();
        Ok(message)
    }

    /// 序列化为远端文档数据（不含 ID，ID 由文档库管理）
    pub fn to_data(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| PairchatSDKError::Serialization(format!("序列化消息失败: {}", e)))?;
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
            // provisional 是纯本地状态，永远不落库
            map.remove("provisional");
        }
        Ok(value)
    }

    /// 检查某身份是否已读此消息
    pub fn is_seen_by(&self, identity: &str) -> bool {
        self.seen_by.iter().any(|u| u == identity)
    }
}

/// 房间的最后一条消息摘要（冗余字段，用于会话列表展示）
///
/// 与消息子集合不在同一事务内更新，允许短暂不一致，下次读取时自愈。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastMessage {
    pub text: String,
    pub sender_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub seen_by: Vec<String>,
}

impl LastMessage {
    pub fn from_message(message: &Message) -> Self {
        Self {
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            created_at: message.created_at,
            seen_by: message.seen_by.clone(),
        }
    }
}

/// 房间实体 - 对应 rooms 集合下的文档
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    /// 规范房间 ID（由参与者集合确定性派生）
    #[serde(default)]
    pub id: String,
    /// 参与者身份集合（1 = 自聊，2 = 私聊）
    pub participants: Vec<String>,
    /// 最后一条消息摘要
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    /// 每个接收方的未读计数
    #[serde(default)]
    pub unread_count: HashMap<String, i64>,
    /// 创建时间（服务端分配）
    #[serde(default)]
    pub created_at: i64,
}

impl Room {
    /// 从远端文档解析房间
    pub fn from_doc(doc: &Document) -> Result<Self> {
        let mut room: Room = serde_json::from_value(doc.data.clone())
            .map_err(|e| PairchatSDKError::InvalidData(format!("解析房间文档失败: {}", e)))?;
        room.id = doc.id.clone();
        Ok(room)
    }

    /// 序列化为远端文档数据
    pub fn to_data(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| PairchatSDKError::Serialization(format!("序列化房间失败: {}", e)))?;
        if let Some(map) = value.as_object_mut() {
            map.remove("id");
        }
        Ok(value)
    }

    /// 获取对端参与者（自聊返回自己）
    pub fn other_participant(&self, current: &str) -> Option<&str> {
        if self.participants.len() == 1 {
            return self.participants.first().map(|s| s.as_str());
        }
        self.participants
            .iter()
            .map(|s| s.as_str())
            .find(|p| *p != current)
    }
}

/// 投递回执状态
///
/// 状态流转图（严格单向，永不回退）：
/// Sent → Delivered → Seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeliveryState {
    /// 远端写入已确认
    Sent = 0,
    /// 已落入共享房间（本系统不建模设备级投递握手）
    Delivered = 1,
    /// 对端身份（自聊为本人）已出现在 seen_by 中
    Seen = 2,
}

impl DeliveryState {
    /// 检查是否可以从当前状态转换到目标状态
    pub fn can_transition_to(&self, target: DeliveryState) -> bool {
        match (self, target) {
            (DeliveryState::Sent, DeliveryState::Delivered) => true,
            (DeliveryState::Sent, DeliveryState::Seen) => true,
            (DeliveryState::Delivered, DeliveryState::Seen) => true,
            _ => false,
        }
    }

    /// 渲染优先级：Seen 覆盖 Delivered，Delivered 覆盖 Sent
    pub fn precedence(&self) -> i32 {
        *self as i32
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DeliveryState::Sent => "已发送",
            DeliveryState::Delivered => "已投递",
            DeliveryState::Seen => "已读",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Default for DeliveryState {
    fn default() -> Self {
        DeliveryState::Sent
    }
}
