//! 内存文档库 - RemoteStoreClient 的参考实现
//!
//! 行为对齐远端契约：
//! - 随机 20 位文档 ID
//! - 严格单调的服务端毫秒时钟（提交时解析时间戳哨兵）
//! - 每次提交后向所有匹配订阅推送完整有序快照
//! - 批量写入按 MAX_BATCH_SIZE 分块，块内原子
//!
//! 测试与演示用。支持故障注入（下一次创建失败、拒绝读取），
//! 用于覆盖发送回滚与权限回退路径。

use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PairchatSDKError, Result};
use crate::store::{
    apply_patch, resolve_path, DocPatch, DocRef, Document, QueryFilter, RemoteStoreClient,
    Subscription, SubscriptionGuard, MAX_BATCH_SIZE, SERVER_TIMESTAMP,
};
use crate::utils::time::now_millis;
use async_trait::async_trait;

/// 故障注入开关（仅测试路径使用）
#[derive(Debug, Default)]
struct FaultInjection {
    /// 下一次 create 返回传输错误
    fail_next_create: bool,
    /// 所有读取返回权限错误
    deny_reads: bool,
}

struct Subscriber {
    collection: String,
    filter: QueryFilter,
    order_by: String,
    sender: mpsc::UnboundedSender<Vec<Document>>,
}

struct Inner {
    /// collection -> (doc_id -> data)
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    /// 服务端单调时钟（毫秒）
    clock: AtomicI64,
    /// 活跃订阅
    subscribers: RwLock<HashMap<String, Subscriber>>,
    faults: RwLock<FaultInjection>,
}

/// 内存文档库
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(HashMap::new()),
                clock: AtomicI64::new(now_millis()),
                subscribers: RwLock::new(HashMap::new()),
                faults: RwLock::new(FaultInjection::default()),
            }),
        }
    }

    /// 让下一次 create 失败（测试发送回滚路径）
    pub fn fail_next_create(&self) {
        self.inner.faults.write().fail_next_create = true;
    }

    /// 开关读取拒绝（测试权限回退路径）
    pub fn set_deny_reads(&self, deny: bool) {
        self.inner.faults.write().deny_reads = deny;
    }

    /// 分配一个服务端时间戳（严格单调）
    fn next_timestamp(&self) -> i64 {
        self.inner.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 生成 20 位随机文档 ID
    fn random_doc_id() -> String {
        let rng = rand::rngs::StdRng::from_entropy();
        rng.sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect()
    }

    fn check_readable(&self) -> Result<()> {
        if self.inner.faults.read().deny_reads {
            return Err(PairchatSDKError::PermissionDenied(
                "读取被拒绝（故障注入）".to_string(),
            ));
        }
        Ok(())
    }

    /// 将数据中的时间戳哨兵替换为服务端时钟值
    fn resolve_server_timestamps(&self, value: &mut Value) {
        match value {
            Value::String(s) if s == SERVER_TIMESTAMP => {
                *value = Value::from(self.next_timestamp());
            }
            Value::Object(map) => {
                for v in map.values_mut() {
                    self.resolve_server_timestamps(v);
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.resolve_server_timestamps(v);
                }
            }
            _ => {}
        }
    }

    /// 查询集合（需要已持有读锁的数据快照）
    fn snapshot_of(
        collections: &HashMap<String, BTreeMap<String, Value>>,
        collection: &str,
        filter: &QueryFilter,
        order_by: &str,
    ) -> Vec<Document> {
        let mut docs: Vec<Document> = collections
            .get(collection)
            .map(|tree| {
                tree.iter()
                    .filter(|(_, data)| filter.matches(data))
                    .map(|(id, data)| Document {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        docs.sort_by(|a, b| {
            let ka = resolve_path(&a.data, order_by).and_then(Value::as_i64);
            let kb = resolve_path(&b.data, order_by).and_then(Value::as_i64);
            ka.cmp(&kb).then_with(|| a.id.cmp(&b.id))
        });
        docs
    }

    /// 提交后向受影响集合的订阅者推送完整快照
    fn notify(&self, affected: &HashSet<String>) {
        let collections = self.inner.collections.read();
        let mut dead = Vec::new();
        {
            let subscribers = self.inner.subscribers.read();
            for (sub_id, sub) in subscribers.iter() {
                if !affected.contains(&sub.collection) {
                    continue;
                }
                let snapshot =
                    Self::snapshot_of(&collections, &sub.collection, &sub.filter, &sub.order_by);
                if sub.sender.send(snapshot).is_err() {
                    dead.push(sub_id.clone());
                }
            }
        }
        drop(collections);

        if !dead.is_empty() {
            let mut subscribers = self.inner.subscribers.write();
            for sub_id in dead {
                subscribers.remove(&sub_id);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStoreClient for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.check_readable()?;
        let collections = self.inner.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|tree| tree.get(id))
            .map(|data| Document {
                id: id.to_string(),
                data: data.clone(),
            }))
    }

    async fn query(
        &self,
        collection: &str,
        filter: &QueryFilter,
        order_by: &str,
    ) -> Result<Vec<Document>> {
        self.check_readable()?;
        let collections = self.inner.collections.read();
        Ok(Self::snapshot_of(&collections, collection, filter, order_by))
    }

    async fn create(&self, collection: &str, id: Option<&str>, data: Value) -> Result<String> {
        {
            let mut faults = self.inner.faults.write();
            if faults.fail_next_create {
                faults.fail_next_create = false;
                return Err(PairchatSDKError::Transport(
                    "创建文档失败（故障注入）".to_string(),
                ));
            }
        }

        let mut data = data;
        self.resolve_server_timestamps(&mut data);

        let doc_id = {
            let mut collections = self.inner.collections.write();
            let tree = collections.entry(collection.to_string()).or_default();
            let doc_id = match id {
                Some(id) => {
                    if tree.contains_key(id) {
                        return Err(PairchatSDKError::AlreadyExists(format!(
                            "文档已存在: {}/{}",
                            collection, id
                        )));
                    }
                    id.to_string()
                }
                None => Self::random_doc_id(),
            };
            tree.insert(doc_id.clone(), data);
            doc_id
        };

        debug!("📄 文档已创建: {}/{}", collection, doc_id);
        let mut affected = HashSet::new();
        affected.insert(collection.to_string());
        self.notify(&affected);
        Ok(doc_id)
    }

    async fn subscribe(
        &self,
        collection: &str,
        filter: QueryFilter,
        order_by: &str,
    ) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sub_id = uuid::Uuid::new_v4().to_string();

        // 首快照与注册在同一临界区内完成，锁序与 notify 一致
        // （先 collections 后 subscribers）：订阅瞬间夹进来的提交
        // 要么已含在首快照里，要么在注册后照常推送，不会丢失
        {
            let collections = self.inner.collections.read();
            let initial = Self::snapshot_of(&collections, collection, &filter, order_by);
            let mut subscribers = self.inner.subscribers.write();
            let _ = sender.send(initial);
            subscribers.insert(
                sub_id.clone(),
                Subscriber {
                    collection: collection.to_string(),
                    filter,
                    order_by: order_by.to_string(),
                    sender,
                },
            );
        }

        let inner = self.inner.clone();
        let guard = SubscriptionGuard::new(Box::new(move || {
            inner.subscribers.write().remove(&sub_id);
        }));

        Ok(Subscription { receiver, guard })
    }

    async fn batch_write(&self, ops: Vec<(DocRef, DocPatch)>) -> Result<()> {
        for chunk in ops.chunks(MAX_BATCH_SIZE) {
            let mut affected = HashSet::new();
            {
                let mut collections = self.inner.collections.write();
                for (doc_ref, patch) in chunk {
                    let tree = collections.entry(doc_ref.collection.clone()).or_default();
                    let data = tree
                        .entry(doc_ref.id.clone())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()));
                    apply_patch(data, patch);
                    self.resolve_server_timestamps(data);
                    affected.insert(doc_ref.collection.clone());
                }
            }
            self.notify(&affected);
        }
        Ok(())
    }

    async fn atomic_increment(&self, doc: &DocRef, field: &str, delta: i64) -> Result<()> {
        self.batch_write(vec![(
            doc.clone(),
            DocPatch::new().with_increment(field, delta),
        )])
        .await
    }

    async fn delete(&self, doc: &DocRef) -> Result<()> {
        let removed = {
            let mut collections = self.inner.collections.write();
            collections
                .get_mut(&doc.collection)
                .and_then(|tree| tree.remove(&doc.id))
                .is_some()
        };
        if removed {
            let mut affected = HashSet::new();
            affected.insert(doc.collection.clone());
            self.notify(&affected);
        }
        Ok(())
    }
}
