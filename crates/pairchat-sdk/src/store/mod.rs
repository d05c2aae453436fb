//! 远端文档库抽象 - RemoteStoreClient
//!
//! 本模块定义客户端与远端最终一致文档库之间的全部契约：
//! - 文档 CRUD 与条件查询
//! - 实时订阅（按提交顺序推送整表快照）
//! - 批量原子写入（固定批大小分块）
//! - 原子计数器
//! - 服务端时间戳（提交时解析，集合内全序）
//!
//! 所有写入都设计为可交换或幂等的（原子自增、只增集合、
//! 创建即已存在视为成功），因此不需要客户端锁或分布式事务。

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;

/// 服务端时间戳哨兵值
///
/// 写入数据中任何等于此值的字符串字段，都会在提交时被
/// 文档库替换为其单调递增的服务端毫秒时间戳。
pub const SERVER_TIMESTAMP: &str = "__server_timestamp__";

/// 单次批量写入的最大文档数（超过则分块提交）
pub const MAX_BATCH_SIZE: usize = 500;

/// 房间集合
pub const ROOMS_COLLECTION: &str = "rooms";

/// 房间的消息子集合路径
pub fn messages_collection(room_id: &str) -> String {
    format!("rooms/{}/messages", room_id)
}

/// 远端文档（ID + 数据）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

/// 文档引用
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    pub collection: String,
    pub id: String,
}

impl DocRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// 文档补丁
///
/// 三类操作分别保证交换律/幂等性：
/// - `set`: 字段覆盖（支持 `a.b` 点路径）
/// - `array_union`: 只增集合合并（重复元素忽略）
/// - `increment`: 原子自增（永不读-改-写）
#[derive(Debug, Clone, Default)]
pub struct DocPatch {
    pub set: Vec<(String, Value)>,
    pub array_union: Vec<(String, Value)>,
    pub increment: Vec<(String, i64)>,
}

impl DocPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set.push((field.into(), value));
        self
    }

    pub fn with_array_union(mut self, field: impl Into<String>, value: Value) -> Self {
        self.array_union.push((field.into(), value));
        self
    }

    pub fn with_increment(mut self, field: impl Into<String>, delta: i64) -> Self {
        self.increment.push((field.into(), delta));
        self
    }
}

/// 查询过滤器（字段相等）
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub equals: Vec<(String, Value)>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.equals.push((field.into(), value));
        self
    }

    /// 判断文档是否匹配
    pub fn matches(&self, data: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| resolve_path(data, field) == Some(expected))
    }
}

/// 订阅取消守卫
///
/// 取消是幂等的：重复调用 `cancel()`、或 Drop 后再次取消，都会被
/// 安全忽略。消费方在每次状态变更前必须检查 `is_cancelled()`，
/// 防止迟到回调在视图关闭后继续改状态。
pub struct SubscriptionGuard {
    cancelled: Arc<AtomicBool>,
    cancel_fn: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new(cancel_fn: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_fn: Some(cancel_fn),
        }
    }

    /// 取消订阅（幂等）
    pub fn cancel(&mut self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            if let Some(f) = self.cancel_fn.take() {
                f();
            }
            tracing::debug!("📴 订阅已取消");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 共享的取消标记（供快照消费任务做"仍然活跃"检查）
    pub fn cancelled_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// 实时订阅：整表快照流 + 取消守卫
///
/// 每次推送都是匹配文档的**完整**有序列表（整表替换，不打补丁）。
/// 单个订阅内快照按服务端提交顺序到达；不同订阅之间没有跨流顺序保证。
pub struct Subscription {
    pub receiver: mpsc::UnboundedReceiver<Vec<Document>>,
    pub guard: SubscriptionGuard,
}

/// 远端文档库客户端契约
#[async_trait]
pub trait RemoteStoreClient: Send + Sync + 'static {
    /// 读取单个文档
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// 条件查询，按 `order_by` 字段升序返回
    async fn query(
        &self,
        collection: &str,
        filter: &QueryFilter,
        order_by: &str,
    ) -> Result<Vec<Document>>;

    /// 创建文档
    ///
    /// - `id` 为 None 时由文档库分配随机 ID
    /// - 指定 `id` 且文档已存在时返回 `AlreadyExists`；
    ///   两个参与者竞态创建同一房间时，调用方将其视为成功
    async fn create(&self, collection: &str, id: Option<&str>, data: Value) -> Result<String>;

    /// 订阅集合的实时快照（按 `order_by` 升序的完整列表）
    async fn subscribe(
        &self,
        collection: &str,
        filter: QueryFilter,
        order_by: &str,
    ) -> Result<Subscription>;

    /// 批量原子写入（内部按 MAX_BATCH_SIZE 分块提交）
    async fn batch_write(&self, ops: Vec<(DocRef, DocPatch)>) -> Result<()>;

    /// 原子自增（永不读-改-写，并发自增不丢失）
    async fn atomic_increment(&self, doc: &DocRef, field: &str, delta: i64) -> Result<()>;

    /// 删除文档
    async fn delete(&self, doc: &DocRef) -> Result<()>;
}

/// 按点路径读取字段
pub(crate) fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// 将补丁应用到文档数据（中间对象按需创建）
pub(crate) fn apply_patch(data: &mut Value, patch: &DocPatch) {
    for (field, value) in &patch.set {
        set_path(data, field, value.clone());
    }
    for (field, value) in &patch.array_union {
        let slot = ensure_path(data, field);
        match slot {
            Value::Array(items) => {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
            other => {
                // 字段不是数组时重建为单元素数组（只增语义的安全回退）
                *other = Value::Array(vec![value.clone()]);
            }
        }
    }
    for (field, delta) in &patch.increment {
        let slot = ensure_path(data, field);
        let current = slot.as_i64().unwrap_or(0);
        *slot = Value::from(current + delta);
    }
}

fn set_path(data: &mut Value, path: &str, value: Value) {
    *ensure_path(data, path) = value;
}

fn ensure_path<'a>(data: &'a mut Value, path: &str) -> &'a mut Value {
    let mut current = data;
    for part in path.split('.') {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert(Value::Null);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let filter = QueryFilter::new().field_eq("room_id", json!("r1"));
        assert!(filter.matches(&json!({"room_id": "r1", "text": "hi"})));
        assert!(!filter.matches(&json!({"room_id": "r2"})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn test_apply_patch_set_dotted_path() {
        let mut data = json!({"last_message": {"text": "old"}});
        let patch = DocPatch::new().with_set("last_message.text", json!("new"));
        apply_patch(&mut data, &patch);
        assert_eq!(data["last_message"]["text"], "new");
    }

    #[test]
    fn test_apply_patch_array_union_is_append_only() {
        let mut data = json!({"seen_by": ["u1"]});
        let patch = DocPatch::new().with_array_union("seen_by", json!("u2"));
        apply_patch(&mut data, &patch);
        assert_eq!(data["seen_by"], json!(["u1", "u2"]));

        // 重复合并被忽略（幂等）
        apply_patch(&mut data, &patch);
        assert_eq!(data["seen_by"], json!(["u1", "u2"]));
    }

    #[test]
    fn test_apply_patch_increment_from_missing_field() {
        let mut data = json!({});
        let patch = DocPatch::new().with_increment("unread_count.u2", 1);
        apply_patch(&mut data, &patch);
        assert_eq!(data["unread_count"]["u2"], 1);

        apply_patch(&mut data, &patch);
        assert_eq!(data["unread_count"]["u2"], 2);
    }

    #[test]
    fn test_subscription_guard_cancel_idempotent() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = counter.clone();
        let mut guard = SubscriptionGuard::new(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!guard.is_cancelled());
        guard.cancel();
        guard.cancel();
        drop(guard);

        // 取消函数只执行一次
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
