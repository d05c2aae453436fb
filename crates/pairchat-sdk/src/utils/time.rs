//! 时间处理工具模块
//!
//! # 设计原则
//!
//! - **实时路径**: 消息时间戳是服务端在提交时分配的 UTC 毫秒时间戳（i64），
//!   同一集合内全序，客户端时钟永远不参与排序
//! - **缓存路径**: 写入本地缓存时序列化为可往返的字符串形式，
//!   读回后还原成与实时路径完全相同的 i64，保证去重/排序逻辑两条路径一致
//! - **本地路径**: 临时消息在确认前使用客户端时钟占位，确认后以快照为准

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{PairchatSDKError, Result};

/// 当前 UTC 毫秒时间戳（仅用于临时消息占位，不参与服务端排序）
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 将服务端毫秒时间戳序列化为缓存字符串（RFC 3339，毫秒精度）
pub fn to_cache_timestamp(timestamp_ms: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp_millis(0).unwrap());
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 从缓存字符串还原毫秒时间戳
///
/// 还原值必须与序列化前逐毫秒相等，去重分桶和排序才能在
/// 缓存数据与实时数据上表现一致。
pub fn parse_cache_timestamp(s: &str) -> Result<i64> {
    let dt = DateTime::parse_from_rfc3339(s)
        .map_err(|e| PairchatSDKError::InvalidData(format!("解析缓存时间戳失败: {}", e)))?;
    Ok(dt.with_timezone(&Utc).timestamp_millis())
}

/// 去重时间分桶：floor(created_at / window_ms)
///
/// 同一 (文本, 发送者) 在同一分桶内的消息视为同一条。
pub fn dedup_bucket(timestamp_ms: i64, window_ms: i64) -> i64 {
    debug_assert!(window_ms > 0);
    timestamp_ms.div_euclid(window_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_timestamp_roundtrip() {
        // 毫秒精度往返必须无损
        let cases = [0i64, 1i64, 999i64, 1_700_000_000_123i64, 1_700_000_000_999i64];
        for ts in cases {
            let s = to_cache_timestamp(ts);
            let back = parse_cache_timestamp(&s).unwrap();
            assert_eq!(back, ts, "往返失败: {} -> {} -> {}", ts, s, back);
        }
    }

    #[test]
    fn test_cache_timestamp_preserves_ordering() {
        let a = to_cache_timestamp(1_700_000_000_100);
        let b = to_cache_timestamp(1_700_000_000_200);
        let ra = parse_cache_timestamp(&a).unwrap();
        let rb = parse_cache_timestamp(&b).unwrap();
        assert!(ra < rb);
    }

    #[test]
    fn test_parse_invalid_timestamp() {
        assert!(parse_cache_timestamp("不是时间戳").is_err());
        assert!(parse_cache_timestamp("").is_err());
    }

    #[test]
    fn test_dedup_bucket() {
        // 2 秒窗口
        assert_eq!(dedup_bucket(0, 2000), 0);
        assert_eq!(dedup_bucket(1999, 2000), 0);
        assert_eq!(dedup_bucket(2000, 2000), 1);
        assert_eq!(dedup_bucket(4001, 2000), 2);
    }
}
