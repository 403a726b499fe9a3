//! 时间处理工具
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **服务端**: 时间字段格式不统一（RFC 3339、`YYYY-MM-DD HH:MM:SS`、纯日期、秒或毫秒数字），
//!   统一用 [`parse_timestamp`] 转成 UTC 毫秒

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// 秒级与毫秒级数字时间戳的分界（约 2001-09-09 的毫秒数）
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// UTC 毫秒 → ISO 8601 字符串
pub fn format_iso8601(utc_timestamp_ms: i64) -> String {
    Utc.timestamp_millis_opt(utc_timestamp_ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// 距今经过的毫秒数（未来时间返回 0）
pub fn millis_since(utc_timestamp_ms: i64) -> i64 {
    (now_millis() - utc_timestamp_ms).max(0)
}

/// 解析服务端返回的时间字段，无法识别时返回 None
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().map(normalize_numeric),
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_timestamp_str(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(normalize_numeric(n));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn normalize_numeric(n: i64) -> i64 {
    if n.abs() < MILLIS_THRESHOLD {
        n * 1000
    } else {
        n
    }
}
