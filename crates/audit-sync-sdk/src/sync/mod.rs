/// 同步模块
///
/// 职责：
/// - 按父子顺序推送待同步记录，逐条确认后删除本地副本
/// - 创建结果不明确时用服务端列表对账
/// - 从服务端拉取列表并清理本地重复
/// - 网络恢复后自动补推

pub mod auto_sync;
pub mod coordinator;
pub mod dedup;
pub mod matcher;
pub mod retry_policy;

pub use auto_sync::AutoSyncRunner;
pub use coordinator::{CoordinatorConfig, KindSummary, RecordOutcome, SyncCoordinator, SyncSummary};
pub use dedup::{DedupReport, DeduplicationPass};
pub use matcher::{MatchOutcome, MatchRule, ReconciliationMatcher};
pub use retry_policy::RetryPolicy;
