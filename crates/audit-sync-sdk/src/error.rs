use serde::{Deserialize, Serialize};

/// SDK 统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum SyncSdkError {
    /// 本地存储打开/读写失败（不自动重试，由 UI 提供重试入口）
    #[error("Storage error: {0}")]
    Storage(String),
    /// 网络不可达（离线或请求直接抛错）
    #[error("Network error: {0}")]
    Network(String),
    /// 服务端暂时不可用（503 类）
    #[error("Server temporarily unavailable: HTTP {0}")]
    Transient(u16),
    /// 响应无法解析（HTML 错误页、非 JSON 等）
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<rusqlite::Error> for SyncSdkError {
    fn from(error: rusqlite::Error) -> Self {
        SyncSdkError::Storage(error.to_string())
    }
}

impl From<serde_json::Error> for SyncSdkError {
    fn from(error: serde_json::Error) -> Self {
        SyncSdkError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncSdkError {
    fn from(error: std::io::Error) -> Self {
        SyncSdkError::IO(error.to_string())
    }
}

impl From<sled::Error> for SyncSdkError {
    fn from(error: sled::Error) -> Self {
        SyncSdkError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for SyncSdkError {
    fn from(error: reqwest::Error) -> Self {
        // 连接失败、超时都按“网络不可达”处理，其余归为响应解析问题
        if error.is_connect() || error.is_timeout() || error.is_request() {
            SyncSdkError::Network(error.to_string())
        } else if error.is_decode() || error.is_body() {
            SyncSdkError::Malformed(error.to_string())
        } else {
            SyncSdkError::Network(error.to_string())
        }
    }
}

impl SyncSdkError {
    /// 是否属于网络不可达（用于直接降级为离线）
    pub fn is_network(&self) -> bool {
        matches!(self, SyncSdkError::Network(_))
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, SyncSdkError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncSdkError>;

/// 单条记录同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    /// 服务端暂时不可用（503/502/504/429）- 退避后重试
    Transient(u16),
    /// 其他 HTTP 错误码 - 走列表兜底
    Http(u16),
    /// 返回了 HTML 错误页
    HtmlPage,
    /// 响应体不是预期的 JSON
    Malformed(String),
    /// 兜底列表里也找不到对应记录
    NoMatch,
    /// 父级稽核尚未同步
    ParentNotSynced,
    /// 请求无法构造（载荷不完整等）
    Invalid(String),
}

impl FailureReason {
    /// 判断是否应在 sync_one 内部退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Transient(_))
    }

    /// 是否为 503 类状态码
    pub fn is_transient_status(status: u16) -> bool {
        matches!(status, 429 | 502 | 503 | 504)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Transient(code) => write!(f, "server temporarily unavailable (HTTP {})", code),
            FailureReason::Http(code) => write!(f, "HTTP {}", code),
            FailureReason::HtmlPage => write!(f, "HTML error page instead of JSON"),
            FailureReason::Malformed(msg) => write!(f, "malformed response: {}", msg),
            FailureReason::NoMatch => write!(f, "no matching server record"),
            FailureReason::ParentNotSynced => write!(f, "parent audit not synced yet"),
            FailureReason::Invalid(msg) => write!(f, "invalid request: {}", msg),
        }
    }
}
