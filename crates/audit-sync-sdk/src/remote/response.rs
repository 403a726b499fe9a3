//! 创建接口响应解码
//!
//! 规则：
//! - 503/502/504/429 → `Failure(Transient)`
//! - 其他非 2xx → `Failure(Http)`
//! - 2xx + HTML → `Failure(HtmlPage)`
//! - 2xx + 带 id 的对象（或 `data.id`）→ `Confirmed`
//! - 2xx + 数组（或 `data` 为数组）→ `AmbiguousList`
//! - 2xx + 对象但没有 id → `Failure(Malformed)`
//! - 2xx + 空响应体 / 非 JSON → `UnknownOutcome`

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::FailureReason;
use crate::remote::{parse_id, CreateResult, RemoteRecord};

static HTML_BODY: OnceLock<Option<Regex>> = OnceLock::new();

/// 判断是否为 HTML 错误页（登录跳转、PHP 报错页等）
pub fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html")) {
        return true;
    }
    HTML_BODY
        .get_or_init(|| Regex::new(r"(?is)^\s*(<!doctype\s+html|<html[\s>]|<head[\s>]|<body[\s>])").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(body))
}

pub fn decode_create_response(status: u16, content_type: Option<&str>, body: &str) -> CreateResult {
    if !(200..300).contains(&status) {
        return if FailureReason::is_transient_status(status) {
            CreateResult::Failure(FailureReason::Transient(status))
        } else {
            CreateResult::Failure(FailureReason::Http(status))
        };
    }

    if looks_like_html(content_type, body) {
        return CreateResult::Failure(FailureReason::HtmlPage);
    }

    if body.trim().is_empty() {
        return CreateResult::UnknownOutcome;
    }

    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            debug!("响应体不是 JSON: {}", e);
            return CreateResult::UnknownOutcome;
        }
    };

    decode_json(&value)
}

fn decode_json(value: &Value) -> CreateResult {
    match value {
        Value::Array(items) => CreateResult::AmbiguousList(decode_list(items)),
        Value::Object(obj) => {
            if let Some(id) = obj.get("id").and_then(parse_id) {
                return CreateResult::Confirmed(id);
            }
            match obj.get("data") {
                Some(Value::Object(data)) => match data.get("id").and_then(parse_id) {
                    Some(id) => CreateResult::Confirmed(id),
                    None => CreateResult::Failure(FailureReason::Malformed("data 中没有 id".to_string())),
                },
                Some(Value::Array(items)) => CreateResult::AmbiguousList(decode_list(items)),
                _ => CreateResult::Failure(FailureReason::Malformed("响应对象中没有 id".to_string())),
            }
        }
        other => CreateResult::Failure(FailureReason::Malformed(format!("意外的 JSON 类型: {}", other))),
    }
}

fn decode_list(items: &[Value]) -> Vec<RemoteRecord> {
    items.iter().filter_map(RemoteRecord::from_json).collect()
}

/// 解析列表接口响应（数组，或 `{ "data": [...] }`）
pub fn decode_list_response(body: &str) -> Result<Vec<RemoteRecord>, FailureReason> {
    if looks_like_html(None, body) {
        return Err(FailureReason::HtmlPage);
    }
    let value: Value = serde_json::from_str(body).map_err(|e| FailureReason::Malformed(e.to_string()))?;
    match &value {
        Value::Array(items) => Ok(decode_list(items)),
        Value::Object(obj) => match obj.get("data") {
            Some(Value::Array(items)) => Ok(decode_list(items)),
            _ => Err(FailureReason::Malformed("列表响应不是数组".to_string())),
        },
        _ => Err(FailureReason::Malformed("列表响应不是数组".to_string())),
    }
}
