//! 房间身份解析 - 规范房间 ID 派生与幂等创建
//!
//! 房间 ID 是参与者集合的纯函数：不访问网络、与参数顺序无关。
//! 两个参与者各自独立计算出的 ID 必然一致，因此双方竞态创建
//! 同一房间是常态而不是异常 —— "已存在"按成功处理。

use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::entities::RoomKind;
use crate::error::Result;
use crate::store::{RemoteStoreClient, ROOMS_COLLECTION, SERVER_TIMESTAMP};

/// 规范房间 ID 长度（SHA-256 十六进制截断）
const ROOM_ID_LEN: usize = 40;

/// 派生规范房间 ID
///
/// - 顺序无关：`resolve(a, b) == resolve(b, a)`
/// - `a == b` 时走独立的自聊命名空间，与任何双人房间都不冲突
pub fn resolve(a: &str, b: &str) -> String {
    if a == b {
        digest(&format!("self:{}", a))
    } else {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        digest(&format!("direct:{}:{}", lo, hi))
    }
}

/// 派生助手会话房间 ID（按身份划分，一人一间）
pub fn assistant_session_id(identity: &str) -> String {
    digest(&format!("assistant:{}", identity))
}

fn digest(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(hash)[..ROOM_ID_LEN].to_string()
}

/// 房间解析器：查找或幂等创建房间文档
pub struct RoomResolver {
    store: Arc<dyn RemoteStoreClient>,
}

impl RoomResolver {
    pub fn new(store: Arc<dyn RemoteStoreClient>) -> Self {
        Self { store }
    }

    /// 查找房间，不存在则创建，返回规范 ID
    ///
    /// 错误处理约定：
    /// - 查找阶段的权限类错误按"房间不存在"处理，继续创建
    /// - 创建阶段的"已存在"按成功处理（双方竞态创建）
    pub async fn get_or_create(&self, current: &str, other: &str) -> Result<String> {
        let room_id = resolve(current, other);
        let kind = RoomKind::classify(current, other);
        self.ensure_room(&room_id, current, other, kind).await?;
        Ok(room_id)
    }

    /// 查找或创建助手会话房间
    pub async fn get_or_create_assistant(&self, identity: &str) -> Result<String> {
        let room_id = assistant_session_id(identity);
        self.ensure_room(&room_id, identity, identity, RoomKind::Assistant)
            .await?;
        Ok(room_id)
    }

    async fn ensure_room(
        &self,
        room_id: &str,
        current: &str,
        other: &str,
        kind: RoomKind,
    ) -> Result<()> {
        match self.store.get(ROOMS_COLLECTION, room_id).await {
            Ok(Some(_)) => {
                debug!("🏠 房间已存在: {} ({})", room_id, kind);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) if e.is_treated_as_absent() => {
                // 权限类读取错误不致命：按不存在处理，尝试创建
                warn!("⚠️ 房间查找被拒绝，按不存在处理: {} ({})", room_id, e);
            }
            Err(e) => return Err(e),
        }

        let participants = match kind {
            RoomKind::SelfChat | RoomKind::Assistant => vec![current.to_string()],
            RoomKind::Direct => {
                let (lo, hi) = if current <= other {
                    (current, other)
                } else {
                    (other, current)
                };
                vec![lo.to_string(), hi.to_string()]
            }
        };

        let mut unread_count = serde_json::Map::new();
        for p in &participants {
            unread_count.insert(p.clone(), json!(0));
        }

        let data = json!({
            "participants": participants,
            "last_message": null,
            "unread_count": unread_count,
            "created_at": SERVER_TIMESTAMP,
        });

        match self.store.create(ROOMS_COLLECTION, Some(room_id), data).await {
            Ok(_) => {
                info!("🏠 房间已创建: {} ({})", room_id, kind);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                // 对端抢先创建了同一房间，视为成功
                debug!("🏠 房间创建竞态，对端已创建: {}", room_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_resolve_is_order_independent() {
        assert_eq!(resolve("u1", "u2"), resolve("u2", "u1"));
        assert_eq!(resolve("alice", "bob"), resolve("bob", "alice"));
    }

    #[test]
    fn test_resolve_self_chat_is_distinct() {
        let self_room = resolve("u1", "u1");
        assert_ne!(self_room, resolve("u1", "u2"));
        assert_ne!(self_room, resolve("u1", "u1x"));
        // 自聊 ID 本身也是确定性的
        assert_eq!(self_room, resolve("u1", "u1"));
    }

    #[test]
    fn test_assistant_session_id_is_per_identity() {
        assert_ne!(assistant_session_id("u1"), assistant_session_id("u2"));
        assert_ne!(assistant_session_id("u1"), resolve("u1", "u1"));
    }

    #[test]
    fn test_room_id_is_fixed_length() {
        assert_eq!(resolve("u1", "u2").len(), ROOM_ID_LEN);
        assert_eq!(resolve("u1", "u1").len(), ROOM_ID_LEN);
    }

    #[tokio::test]
    async fn test_get_or_create_creates_once() {
        let store = Arc::new(MemoryStore::new());
        let resolver = RoomResolver::new(store.clone());

        let id1 = resolver.get_or_create("u1", "u2").await.unwrap();
        let id2 = resolver.get_or_create("u2", "u1").await.unwrap();
        assert_eq!(id1, id2);

        let doc = store
            .get(ROOMS_COLLECTION, &id1)
            .await
            .unwrap()
            .expect("房间应已创建");
        assert_eq!(doc.data["participants"], serde_json::json!(["u1", "u2"]));
    }

    #[tokio::test]
    async fn test_get_or_create_race_is_success() {
        let store = Arc::new(MemoryStore::new());
        let resolver_a = RoomResolver::new(store.clone());
        let resolver_b = RoomResolver::new(store.clone());

        // 双方同时创建同一房间
        let (a, b) = tokio::join!(
            resolver_a.get_or_create("u1", "u2"),
            resolver_b.get_or_create("u2", "u1")
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_denied_lookup_falls_through_to_create() {
        let store = Arc::new(MemoryStore::new());
        let resolver = RoomResolver::new(store.clone());

        // 读取被拒绝时按"不存在"处理，直接尝试创建
        store.set_deny_reads(true);
        let id = resolver.get_or_create("u1", "u2").await.unwrap();
        store.set_deny_reads(false);

        assert!(store.get(ROOMS_COLLECTION, &id).await.unwrap().is_some());
    }
}
