//! 服务端接口 - 同步引擎与服务端 CRUD 之间的接缝
//!
//! 服务端并非完全幂等：创建接口有时返回新记录 ID，有时返回整张列表。
//! 所有响应在边界处统一解码成 [`CreateResult`]，上层只处理这一种形状。

pub mod http_client;
pub mod response;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FailureReason, Result};
use crate::storage::entities::{EntityKind, RecordPayload};
use crate::utils::time::parse_timestamp;

pub use http_client::HttpRemoteApi;
pub use response::decode_create_response;

const ID_KEYS: [&str; 3] = ["id", "ID", "Id"];
const TITLE_KEYS: [&str; 6] = ["title", "name", "label", "filename", "point_id", "audit_point_id"];
const CREATED_AT_KEYS: [&str; 5] = ["created_at", "createdAt", "date_creation", "timestamp", "date"];

/// 服务端列表项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: i64,
    /// 用于匹配的文本（标题、名称、文件名……）
    pub title: Option<String>,
    /// 创建时间（UTC 毫秒）
    pub created_at: Option<i64>,
    /// 原始 JSON，拉取时用来还原本地载荷
    #[serde(default)]
    pub raw: Value,
}

impl RemoteRecord {
    pub fn new(id: i64, title: impl Into<String>, created_at: Option<i64>) -> Self {
        let title = title.into();
        Self {
            id,
            raw: serde_json::json!({ "id": id, "title": title }),
            title: Some(title),
            created_at,
        }
    }

    /// 从服务端 JSON 对象解析；没有可用 id 时返回 None
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let id = ID_KEYS.iter().find_map(|k| obj.get(*k).and_then(parse_id))?;
        let title = TITLE_KEYS.iter().find_map(|k| match obj.get(*k)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let created_at = CREATED_AT_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(parse_timestamp));

        Some(Self {
            id,
            title,
            created_at,
            raw: value.clone(),
        })
    }

    /// 原始 JSON 中的整数字段（数字或数字字符串），按别名依次查找
    pub fn int_field(&self, keys: &[&str]) -> Option<i64> {
        keys.iter().find_map(|k| match self.raw.get(*k)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    /// 原始 JSON 中的字符串字段，按别名依次查找
    pub fn str_field(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.raw.get(*k).and_then(Value::as_str))
    }
}

/// 解析数字或数字字符串形式的 ID
pub(crate) fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|id| *id > 0),
        Value::String(s) => s.trim().parse::<i64>().ok().filter(|id| *id > 0),
        _ => None,
    }
}

/// 创建/更新接口的统一结果
#[derive(Debug, Clone, PartialEq)]
pub enum CreateResult {
    /// 服务端明确返回了新记录 ID
    Confirmed(i64),
    /// 服务端返回了一张列表，需要靠匹配找出刚创建的记录
    AmbiguousList(Vec<RemoteRecord>),
    Failure(FailureReason),
    /// 2xx 但响应体为空或无法解析，不知道是否创建成功
    UnknownOutcome,
}

impl CreateResult {
    pub fn is_transient(&self) -> bool {
        matches!(self, CreateResult::Failure(reason) if reason.is_retryable())
    }
}

/// 服务端 API
#[async_trait]
pub trait RemoteApi: Send + Sync + std::fmt::Debug {
    /// 创建文章 / 稽核
    async fn create(&self, kind: EntityKind, payload: &RecordPayload) -> Result<CreateResult>;

    /// 获取整张列表（兜底匹配和拉取都用它）
    async fn list(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>>;

    /// 提交稽核点评估
    async fn update_evaluation(&self, payload: &RecordPayload) -> Result<CreateResult>;

    /// 上传文档 / 照片
    async fn add_document(&self, payload: &RecordPayload) -> Result<CreateResult>;
}
