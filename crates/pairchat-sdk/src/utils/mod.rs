pub mod time;

pub use time::{dedup_bucket, now_millis, parse_cache_timestamp, to_cache_timestamp};
