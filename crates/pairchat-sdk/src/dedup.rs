//! 消息去重器
//!
//! 对渲染列表（已确认消息 + 存活的本地临时条目）做启发式去重：
//! 键为 (文本, 发送者, floor(created_at / 窗口))，每个键保留首次出现。
//! 一次去重同时消掉两类重复：
//! - 文档库的字面重复推送
//! - 确认副本到达后残留的本地临时条目
//!
//! 这是真正幂等键的启发式替代：窗口内的合法快速重复消息理论上
//! 会被误合并。TODO: 给临时消息附带客户端幂等令牌并由文档库
//! 往返，替换此启发式（需要远端写入路径配合）。

use std::collections::HashSet;
use tracing::debug;

use crate::entities::Message;
use crate::utils::time::dedup_bucket;

/// 默认去重窗口（毫秒）
pub const DEFAULT_DEDUP_WINDOW_MS: i64 = 2000;

/// 消息去重器
#[derive(Debug, Clone)]
pub struct Deduplicator {
    window_ms: i64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self {
            window_ms: DEFAULT_DEDUP_WINDOW_MS,
        }
    }

    /// 使用自定义窗口创建去重器
    pub fn with_window(window_ms: i64) -> Self {
        Self { window_ms }
    }

    /// 计算消息的去重键
    pub fn key_of(&self, message: &Message) -> (String, String, i64) {
        (
            message.text.clone(),
            message.sender_id.clone(),
            dedup_bucket(message.created_at, self.window_ms),
        )
    }

    /// 对有序列表去重，每个键保留首次出现
    ///
    /// 输入必须已按 created_at 升序排列；已确认条目排在同键的
    /// 临时条目之前时，临时条目会被折叠掉。
    pub fn collapse(&self, messages: Vec<Message>) -> Vec<Message> {
        let input_len = messages.len();
        let mut seen_keys: HashSet<(String, String, i64)> = HashSet::with_capacity(input_len);
        let mut result = Vec::with_capacity(input_len);

        for message in messages {
            let key = self.key_of(&message);
            if seen_keys.insert(key) {
                result.push(message);
            }
        }

        if result.len() < input_len {
            debug!("🔄 去重折叠 {} 条消息", input_len - result.len());
        }
        result
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, text: &str, sender: &str, created_at: i64, provisional: bool) -> Message {
        Message {
            id: id.to_string(),
            room_id: "r1".to_string(),
            text: text.to_string(),
            sender_id: sender.to_string(),
            created_at,
            seen_by: Vec::new(),
            delivered: !provisional,
            seen: false,
            provisional,
        }
    }

    #[test]
    fn test_literal_duplicates_collapsed() {
        let dedup = Deduplicator::new();
        let result = dedup.collapse(vec![
            message("a", "hi", "u1", 1000, false),
            message("a2", "hi", "u1", 1500, false),
        ]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "a");
    }

    #[test]
    fn test_confirmed_folds_provisional() {
        // 确认副本先于临时条目出现时，临时条目被折叠
        let dedup = Deduplicator::new();
        let result = dedup.collapse(vec![
            message("srv_1", "hello", "u1", 1000, false),
            message("local_1", "hello", "u1", 1200, true),
        ]);
        assert_eq!(result.len(), 1);
        assert!(!result[0].provisional);
    }

    #[test]
    fn test_different_senders_not_collapsed() {
        let dedup = Deduplicator::new();
        let result = dedup.collapse(vec![
            message("a", "hi", "u1", 1000, false),
            message("b", "hi", "u2", 1000, false),
        ]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_outside_window_not_collapsed() {
        let dedup = Deduplicator::with_window(2000);
        let result = dedup.collapse(vec![
            message("a", "hi", "u1", 1000, false),
            message("b", "hi", "u1", 4100, false),
        ]);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_rapid_double_send_single_confirmation() {
        // 快速连发同文本两次，文档库只确认一条：渲染结果恰好一条
        let dedup = Deduplicator::new();
        let result = dedup.collapse(vec![
            message("srv_1", "hi", "u1", 1000, false),
            message("local_1", "hi", "u1", 1010, true),
            message("local_2", "hi", "u1", 1020, true),
        ]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "srv_1");
    }

    #[test]
    fn test_empty_input() {
        let dedup = Deduplicator::new();
        assert!(dedup.collapse(Vec::new()).is_empty());
    }
}
