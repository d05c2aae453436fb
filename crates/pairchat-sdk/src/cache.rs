//! 离线缓存模块 - 基于 sled 的消息列表镜像
//!
//! 为助手会话保存最近一次非空快照的完整消息列表：
//! - 每次非空实时快照后整体覆盖写入（不合并）
//! - 仅在实时查询返回空结果时读取回退
//! - 时间戳序列化为可往返字符串，读回后与实时路径同型同序，
//!   去重/回执逻辑在两条路径上表现一致

use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::entities::Message;
use crate::error::{PairchatSDKError, Result};
use crate::utils::time::{parse_cache_timestamp, to_cache_timestamp};

/// 缓存键前缀
mod keys {
    /// 房间消息列表前缀
    pub const MESSAGE_LIST: &str = "msg_list_";
}

/// 缓存条目中的消息（时间戳为字符串形式）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedMessage {
    id: String,
    room_id: String,
    text: String,
    sender_id: String,
    /// RFC 3339 毫秒精度字符串
    created_at: String,
    #[serde(default)]
    seen_by: Vec<String>,
    #[serde(default)]
    delivered: bool,
    #[serde(default)]
    seen: bool,
}

impl CachedMessage {
    fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            room_id: message.room_id.clone(),
            text: message.text.clone(),
            sender_id: message.sender_id.clone(),
            created_at: to_cache_timestamp(message.created_at),
            seen_by: message.seen_by.clone(),
            delivered: message.delivered,
            seen: message.seen,
        }
    }

    fn into_message(self) -> Result<Message> {
        let created_at = parse_cache_timestamp(&self.created_at)?;
        Ok(Message {
            id: self.id,
            room_id: self.room_id,
            text: self.text,
            sender_id: self.sender_id,
            created_at,
            seen_by: self.seen_by,
            delivered: self.delivered,
            seen: self.seen,
            // 缓存里只有确认过的消息
            provisional: false,
        })
    }
}

/// 离线缓存
#[derive(Clone)]
pub struct OfflineCache {
    db: Arc<Db>,
}

impl OfflineCache {
    /// 打开缓存（切换账号后旧实例可能刚释放锁，重试多次带退避）
    pub async fn open(base_path: &Path) -> Result<Self> {
        let cache_path = base_path.join("offline_cache");
        tokio::fs::create_dir_all(&cache_path)
            .await
            .map_err(|e| PairchatSDKError::IO(format!("创建缓存目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&cache_path) {
                Ok(db) => {
                    info!("💾 离线缓存已打开: {}", cache_path.display());
                    return Ok(Self { db: Arc::new(db) });
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        Err(PairchatSDKError::KvStore(
            last_err
                .map(|e| format!("打开 sled 数据库失败: {}", e))
                .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
        ))
    }

    fn cache_key(key: &str) -> String {
        format!("{}{}", keys::MESSAGE_LIST, key)
    }

    /// 写透：整体覆盖指定键的消息列表
    pub fn write_through(&self, key: &str, messages: &[Message]) -> Result<()> {
        let cached: Vec<CachedMessage> = messages.iter().map(CachedMessage::from_message).collect();
        let bytes = serde_json::to_vec(&cached)
            .map_err(|e| PairchatSDKError::Serialization(format!("序列化缓存条目失败: {}", e)))?;

        self.db
            .insert(Self::cache_key(key), bytes)
            .map_err(|e| PairchatSDKError::KvStore(format!("写入缓存失败: {}", e)))?;

        debug!("💾 缓存已覆盖: key={}, {} 条消息", key, messages.len());
        Ok(())
    }

    /// 读取回退：实时查询为空时的唯一数据来源
    pub fn read_fallback(&self, key: &str) -> Result<Option<Vec<Message>>> {
        let bytes = self
            .db
            .get(Self::cache_key(key))
            .map_err(|e| PairchatSDKError::KvStore(format!("读取缓存失败: {}", e)))?;

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        let cached: Vec<CachedMessage> = serde_json::from_slice(&bytes)
            .map_err(|e| PairchatSDKError::Serialization(format!("反序列化缓存条目失败: {}", e)))?;

        let mut messages = Vec::with_capacity(cached.len());
        for entry in cached {
            messages.push(entry.into_message()?);
        }
        debug!("💾 缓存回退命中: key={}, {} 条消息", key, messages.len());
        Ok(Some(messages))
    }

    /// 删除指定键的缓存（随房间删除一起调用）
    pub fn remove(&self, key: &str) -> Result<()> {
        self.db
            .remove(Self::cache_key(key))
            .map_err(|e| PairchatSDKError::KvStore(format!("删除缓存失败: {}", e)))?;
        Ok(())
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| PairchatSDKError::KvStore(format!("缓存刷盘失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn message(id: &str, text: &str, created_at: i64) -> Message {
        Message {
            id: id.to_string(),
            room_id: "session_u1".to_string(),
            text: text.to_string(),
            sender_id: "u1".to_string(),
            created_at,
            seen_by: vec!["u1".to_string()],
            delivered: true,
            seen: true,
            provisional: false,
        }
    }

    #[tokio::test]
    async fn test_cache_roundtrip_preserves_order_and_timestamps() {
        let temp_dir = TempDir::new().unwrap();
        let cache = OfflineCache::open(temp_dir.path()).await.unwrap();

        let messages = vec![
            message("m1", "第一条", 1_700_000_000_100),
            message("m2", "第二条", 1_700_000_000_250),
            message("m3", "第三条", 1_700_000_001_999),
        ];
        cache.write_through("session_u1", &messages).unwrap();

        let restored = cache.read_fallback("session_u1").unwrap().unwrap();
        assert_eq!(restored.len(), 3);
        for (original, back) in messages.iter().zip(restored.iter()) {
            assert_eq!(original.id, back.id);
            // 时间戳逐毫秒相等，排序/去重在缓存数据上与实时数据一致
            assert_eq!(original.created_at, back.created_at);
        }
    }

    #[tokio::test]
    async fn test_write_through_overwrites_not_merges() {
        let temp_dir = TempDir::new().unwrap();
        let cache = OfflineCache::open(temp_dir.path()).await.unwrap();

        let three = vec![
            message("m1", "a", 1000),
            message("m2", "b", 2000),
            message("m3", "c", 3000),
        ];
        cache.write_through("k", &three).unwrap();

        // 新快照只有 2 条：覆盖而不是合并成 5 条
        let two = vec![message("m4", "d", 4000), message("m5", "e", 5000)];
        cache.write_through("k", &two).unwrap();

        let restored = cache.read_fallback("k").unwrap().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id, "m4");
    }

    #[tokio::test]
    async fn test_read_fallback_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let cache = OfflineCache::open(temp_dir.path()).await.unwrap();
        assert!(cache.read_fallback("不存在的键").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let cache = OfflineCache::open(temp_dir.path()).await.unwrap();

        cache.write_through("k", &[message("m1", "a", 1000)]).unwrap();
        cache.remove("k").unwrap();
        assert!(cache.read_fallback("k").unwrap().is_none());
    }
}
