//! Audit Sync SDK - 离线优先的数据同步引擎
//!
//! 面向现场稽核类应用：文章、稽核、评估和文档先写入本地，
//! 联网时逐条推送到服务端，服务端确认后删除本地副本。
//! - 📦 本地存储：SQLite（DB Actor 串行访问），一种实体一张表
//! - 📡 连通性监控：网络恢复后自动补推
//! - 🔎 对账匹配：创建结果不明确时用服务端列表找回记录
//! - 🧹 去重清理：拉取服务端列表后移除本地重复和孤儿记录
//! - ⚙️ 事件系统：保存、同步、汇总统一通过事件通知 UI
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use audit_sync_sdk::{AuditSyncSDK, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .server_base_url("https://audit.example.com")
//!         .build()?;
//!
//!     let sdk = AuditSyncSDK::initialize(config).await?;
//!
//!     // 离线时只写本地，联网后自动推送
//!     let local_id = sdk.save_article("T1", "C1").await?;
//!     println!("已保存 local_id={}", local_id);
//!
//!     let summary = sdk.sync_all().await?;
//!     println!("成功 {} 条，失败 {} 条", summary.total_success(), summary.total_failed());
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod error;
pub mod events;
pub mod logging;
pub mod network;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

#[cfg(test)]
mod test_helpers;

// 重新导出核心类型，方便使用
pub use error::{FailureReason, Result, SyncSdkError};
pub use events::{EventFilter, EventManager, SyncEvent};
pub use logging::init_tracing;
pub use network::{ConnectivityMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use remote::{CreateResult, HttpRemoteApi, RemoteApi, RemoteRecord};
pub use sdk::{AuditSyncSDK, EndpointConfig, HttpClientConfig, SyncConfig, SyncConfigBuilder};
pub use storage::{EntityKind, LocalStore, ParentRef, Record, RecordPayload, SyncStatus};
pub use sync::{
    DedupReport, DeduplicationPass, MatchRule, ReconciliationMatcher, RecordOutcome, RetryPolicy,
    SyncCoordinator, SyncSummary,
};
pub use version::SDK_VERSION;
