//! Pairchat SDK - 点对点聊天客户端核心
//!
//! 面向最终一致文档库的客户端消息同步内核，包括：
//! - 🏠 规范房间身份：参与者集合的纯函数派生，双方竞态创建即幂等
//! - 📡 实时消息流：整表快照替换 + 助手会话的离线缓存回退
//! - 📤 乐观发送：先渲染后落库，失败回滚并恰好一次报错
//! - ✔️ 投递回执：Sent → Delivered → Seen 严格单向状态机
//! - 👀 已读补记：打开房间时批量标记 + 未读数精确归零
//! - 💾 离线缓存：sled 持久化消息镜像，时间戳字符串往返
//! - 📣 事件系统：统一的事件广播和订阅机制
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use pairchat_sdk::{PairchatConfig, PairchatSDK};
//! use pairchat_sdk::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PairchatConfig::new("u1", "/path/to/data")
//!         .with_assistant_base_url("https://assistant.example.com/reply");
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let sdk = PairchatSDK::initialize(config, store).await?;
//!
//!     // 打开与 u2 的私聊并发送消息
//!     let session = sdk.open_room("u2").await?;
//!     session.send("Hello!").await?;
//!
//!     // 订阅渲染列表更新
//!     let mut snapshots = session.snapshots();
//!     let rendered = snapshots.recv().await?;
//!     println!("当前 {} 条消息", rendered.len());
//!
//!     session.close();
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod assistant;
pub mod cache;
pub mod dedup;
pub mod entities;
pub mod error;
pub mod events;
pub mod receipt;
pub mod room;
pub mod sdk;
pub mod seen;
pub mod send;
pub mod store;
pub mod stream;
pub mod utils;

pub use entities::{DeliveryState, LastMessage, Message, Room, RoomKind};
pub use error::{PairchatSDKError, Result};
pub use events::{EventManager, SDKEvent};
pub use sdk::{ChatSession, HttpClientConfig, PairchatConfig, PairchatSDK};
pub use store::{MemoryStore, RemoteStoreClient};

/// SDK 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
