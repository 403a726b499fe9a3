//! 同步协调器
//!
//! 把本地待同步记录逐条推送到服务端：
//! 认领（Syncing）→ 提交 → 解码响应 → 匹配 → 确认后删除本地副本。
//! 记录按固定顺序（稽核、文章、评估、文档）串行处理，两条之间留出间隔，避免压垮服务端。

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FailureReason, Result, SyncSdkError};
use crate::events::{EventManager, SyncEvent};
use crate::network::ConnectivityMonitor;
use crate::remote::{CreateResult, RemoteApi};
use crate::storage::entities::{EntityKind, ParentRef, Record, RecordPayload};
use crate::storage::kv::SyncMetaStore;
use crate::storage::local_store::LocalStore;
use crate::sync::dedup::{DedupReport, DeduplicationPass};
use crate::sync::matcher::{MatchOutcome, MatchRule, ReconciliationMatcher};
use crate::sync::retry_policy::RetryPolicy;
use crate::utils::time::now_millis;

/// 协调器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 两条记录之间的间隔（毫秒）
    pub inter_record_delay_ms: u64,
    /// 服务端暂时不可用时的退避
    pub retry_policy: RetryPolicy,
    /// 2xx 但响应无法解析、兜底查询也找不到时，是否当作成功
    pub optimistic_unknown_outcome: bool,
    /// 兜底查询只用标题规则，不做“取最新”猜测
    #[serde(default)]
    pub title_only_fallback: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            inter_record_delay_ms: 500,
            retry_policy: RetryPolicy::default(),
            optimistic_unknown_outcome: false,
            title_only_fallback: false,
        }
    }
}

/// 单条记录的同步结果
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// 服务端已确认，本地副本已删除
    Synced {
        server_id: Option<i64>,
        rule: Option<MatchRule>,
    },
    /// 失败，记录保留为 Failed
    Failed(FailureReason),
    /// 父级稽核还没同步，留到父级确认之后
    Deferred,
    /// 记录正在被另一轮同步处理
    Busy,
    /// 记录已有服务端 ID，无需推送
    AlreadySynced,
    NotFound,
    /// 离线，记录保持 Pending
    Offline,
}

impl RecordOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Synced { .. })
    }
}

/// 单种实体的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 一轮 sync_all 的汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub pass_id: String,
    pub started_at: i64,
    pub finished_at: i64,
    /// 开始时处于离线，整轮跳过
    pub skipped_offline: bool,
    pub per_kind: BTreeMap<EntityKind, KindSummary>,
}

impl SyncSummary {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            pass_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            finished_at: now,
            skipped_offline: false,
            per_kind: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, kind: EntityKind, outcome: &RecordOutcome) {
        let entry = self.per_kind.entry(kind).or_default();
        match outcome {
            RecordOutcome::Synced { .. } => entry.success += 1,
            RecordOutcome::Failed(_) => entry.failed += 1,
            _ => entry.skipped += 1,
        }
    }

    pub fn kind(&self, kind: EntityKind) -> KindSummary {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_success(&self) -> usize {
        self.per_kind.values().map(|s| s.success).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.per_kind.values().map(|s| s.failed).sum()
    }

    pub fn total_skipped(&self) -> usize {
        self.per_kind.values().map(|s| s.skipped).sum()
    }

    fn finish(&mut self) {
        self.finished_at = now_millis();
    }
}

impl Default for SyncSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// 同步协调器
#[derive(Debug)]
pub struct SyncCoordinator {
    store: LocalStore,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    meta: Option<SyncMetaStore>,
    matcher: ReconciliationMatcher,
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
        monitor: Arc<ConnectivityMonitor>,
        events: Arc<EventManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            remote,
            monitor,
            events,
            meta: None,
            matcher: ReconciliationMatcher::new(),
            config,
        }
    }

    /// 保存每轮汇总和拉取时间
    pub fn with_meta_store(mut self, meta: SyncMetaStore) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// 推送所有待同步记录
    ///
    /// 开始前按平台状态刷新一次连通性；离线时不发任何请求，直接返回 `skipped_offline` 的空汇总。
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let mut summary = SyncSummary::new();

        self.monitor.refresh().await;
        if !self.monitor.is_online() {
            info!("离线，跳过本轮同步");
            summary.skipped_offline = true;
            return Ok(self.complete_pass(summary).await);
        }

        info!("🔄 开始同步 pass_id={}", summary.pass_id);
        let delay = Duration::from_millis(self.config.inter_record_delay_ms);
        let mut processed = 0usize;

        // 每种实体单独查询待同步列表，稽核确认后改挂的子记录在同一轮就能推送
        for kind in EntityKind::PUSH_ORDER {
            let pending = self.store.pending(kind).await?;
            if pending.is_empty() {
                continue;
            }
            debug!("{} 待同步 {} 条", kind, pending.len());

            for record in pending {
                if !self.monitor.is_online() {
                    summary.record(kind, &RecordOutcome::Offline);
                    continue;
                }
                if processed > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                processed += 1;

                let outcome = match self.sync_record(record).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("同步 {} 失败（本地存储）: {}", kind, e);
                        RecordOutcome::Failed(FailureReason::Invalid(e.to_string()))
                    }
                };
                summary.record(kind, &outcome);
            }
        }

        let summary = self.complete_pass(summary).await;
        info!(
            "✅ 同步结束 pass_id={} 成功 {} 失败 {} 跳过 {}",
            summary.pass_id,
            summary.total_success(),
            summary.total_failed(),
            summary.total_skipped()
        );
        Ok(summary)
    }

    async fn complete_pass(&self, mut summary: SyncSummary) -> SyncSummary {
        summary.finish();

        if let Some(meta) = &self.meta {
            if let Err(e) = meta.save_summary(&summary) {
                warn!("保存同步汇总失败: {}", e);
            }
        }

        self.events.emit(SyncEvent::PassCompleted(summary.clone())).await;
        if summary.total_success() > 0 {
            self.events
                .emit(SyncEvent::RefreshRequested {
                    pass_id: summary.pass_id.clone(),
                    timestamp: summary.finished_at,
                })
                .await;
        }
        summary
    }

    /// 推送单条记录
    #[instrument(skip(self))]
    pub async fn sync_one(&self, kind: EntityKind, local_id: i64) -> Result<RecordOutcome> {
        if !kind.is_pushable() {
            return Err(SyncSdkError::InvalidArgument(format!("{} 不需要推送", kind)));
        }
        self.monitor.refresh().await;
        if !self.monitor.is_online() {
            return Ok(RecordOutcome::Offline);
        }
        match self.store.get(kind, local_id).await? {
            Some(record) => self.sync_record(record).await,
            None => Ok(RecordOutcome::NotFound),
        }
    }

    async fn sync_record(&self, record: Record) -> Result<RecordOutcome> {
        let kind = record.kind();
        let local_id = record.local_id;

        if record.server_id.is_some() {
            return Ok(RecordOutcome::AlreadySynced);
        }
        if matches!(record.payload.parent(), Some(ParentRef::Local(_))) {
            debug!("{} local_id={} 父级稽核未同步，延后", kind, local_id);
            return Ok(RecordOutcome::Deferred);
        }
        if !self.store.claim_for_sync(kind, local_id).await? {
            debug!("{} local_id={} 已被占用", kind, local_id);
            return Ok(RecordOutcome::Busy);
        }

        let result = match self.submit_with_retry(&record.payload).await {
            Ok(result) => result,
            Err(e) => return self.handle_submit_error(&record, e).await,
        };

        if let Some(outcome) = self.matcher.match_record(&record.payload, &result) {
            return self.confirm(&record, outcome).await;
        }

        self.fall_back_to_list(&record, result).await
    }

    /// 提交，遇到 503 类响应时退避重试
    async fn submit_with_retry(&self, payload: &RecordPayload) -> Result<CreateResult> {
        let mut retry_count = 0;
        loop {
            let result = self.submit(payload).await?;
            let reason = match &result {
                CreateResult::Failure(reason) if result.is_transient() => reason,
                _ => return Ok(result),
            };
            let Some(delay) = self.config.retry_policy.next_delay(retry_count, reason) else {
                return Ok(result);
            };
            warn!(
                "{} 服务端暂时不可用 ({})，{} ms 后第 {} 次重试",
                payload.kind(),
                reason,
                delay.as_millis(),
                retry_count + 1
            );
            tokio::time::sleep(delay).await;
            if !self.monitor.is_online() {
                return Err(SyncSdkError::Network("重试前网络已断开".to_string()));
            }
            retry_count += 1;
        }
    }

    async fn submit(&self, payload: &RecordPayload) -> Result<CreateResult> {
        match payload {
            RecordPayload::Evaluation { .. } => self.remote.update_evaluation(payload).await,
            RecordPayload::Document { .. } => self.remote.add_document(payload).await,
            _ => self.remote.create(payload.kind(), payload).await,
        }
    }

    async fn handle_submit_error(&self, record: &Record, e: SyncSdkError) -> Result<RecordOutcome> {
        let kind = record.kind();
        if e.is_network() {
            warn!("{} local_id={} 提交时网络失败: {}", kind, record.local_id, e);
            self.monitor.report_network_failure();
            self.store.release(kind, record.local_id).await?;
            return Ok(RecordOutcome::Offline);
        }
        if e.is_storage() {
            self.store.release(kind, record.local_id).await?;
            return Err(e);
        }
        let reason = FailureReason::Invalid(e.to_string());
        self.fail(record, reason).await
    }

    /// 创建结果无法直接匹配时，拉取列表重新匹配一次
    async fn fall_back_to_list(&self, record: &Record, result: CreateResult) -> Result<RecordOutcome> {
        let kind = record.kind();
        let reason = match &result {
            CreateResult::Failure(reason) => reason.clone(),
            CreateResult::AmbiguousList(_) => FailureReason::NoMatch,
            CreateResult::UnknownOutcome => FailureReason::Malformed("响应为空或无法解析".to_string()),
            CreateResult::Confirmed(_) => FailureReason::NoMatch,
        };
        info!("{} local_id={} 创建结果无法确认 ({})，查询列表兜底", kind, record.local_id, reason);

        let list = match self.remote.list(kind).await {
            Ok(list) => list,
            Err(e) if e.is_network() => {
                self.monitor.report_network_failure();
                self.store.release(kind, record.local_id).await?;
                return Ok(RecordOutcome::Offline);
            }
            Err(e) => {
                warn!("{} 列表查询失败: {}", kind, e);
                return self.fail(record, reason).await;
            }
        };

        let recency = !self.config.title_only_fallback;
        if let Some(outcome) = self.matcher.match_record_list(&record.payload, &list, recency) {
            return self.confirm(record, outcome).await;
        }

        if result == CreateResult::UnknownOutcome && self.config.optimistic_unknown_outcome && kind != EntityKind::Audit {
            warn!("{} local_id={} 结果未知，按配置视为成功", kind, record.local_id);
            self.store.delete(kind, record.local_id).await?;
            self.events
                .emit(SyncEvent::record_synced(kind, record.local_id, None, None))
                .await;
            return Ok(RecordOutcome::Synced { server_id: None, rule: None });
        }

        self.fail(record, reason).await
    }

    async fn confirm(&self, record: &Record, outcome: MatchOutcome) -> Result<RecordOutcome> {
        let kind = record.kind();
        if outcome.rule.is_heuristic() {
            warn!(
                "{} local_id={} 通过 {} 规则匹配到 server_id={}",
                kind, record.local_id, outcome.rule, outcome.server_id
            );
        }
        self.store.confirm(kind, record.local_id, outcome.server_id).await?;
        info!("✅ {} local_id={} → server_id={}", kind, record.local_id, outcome.server_id);

        self.events
            .emit(SyncEvent::record_synced(kind, record.local_id, Some(outcome.server_id), Some(outcome.rule)))
            .await;
        Ok(RecordOutcome::Synced {
            server_id: Some(outcome.server_id),
            rule: Some(outcome.rule),
        })
    }

    async fn fail(&self, record: &Record, reason: FailureReason) -> Result<RecordOutcome> {
        let kind = record.kind();
        warn!("❌ {} local_id={} 同步失败: {}", kind, record.local_id, reason);
        self.store.mark_failed(kind, record.local_id, reason.to_string()).await?;
        self.events
            .emit(SyncEvent::record_sync_failed(kind, record.local_id, reason.to_string()))
            .await;
        Ok(RecordOutcome::Failed(reason))
    }

    /// 整表拉取并去重（文章、稽核、稽核点）
    #[instrument(skip(self))]
    pub async fn pull_from_server(&self, kind: EntityKind) -> Result<DedupReport> {
        if !kind.is_pullable() {
            return Err(SyncSdkError::InvalidArgument(format!("{} 不支持拉取", kind)));
        }
        self.monitor.refresh().await;
        if !self.monitor.is_online() {
            return Err(SyncSdkError::Network("离线，无法拉取".to_string()));
        }

        let remote = self.remote.list(kind).await.map_err(|e| {
            if e.is_network() {
                self.monitor.report_network_failure();
            }
            e
        })?;
        debug!("{} 拉取到 {} 条", kind, remote.len());

        let report = DeduplicationPass::new(self.store.clone()).run(kind, &remote).await?;

        let now = now_millis();
        if let Some(meta) = &self.meta {
            if let Err(e) = meta.set_last_pull(kind, now) {
                warn!("保存 {} 拉取时间失败: {}", kind, e);
            }
        }
        self.events
            .emit(SyncEvent::PullCompleted { kind, report, timestamp: now })
            .await;
        Ok(report)
    }

    /// 依次拉取所有可拉取的实体；某一种失败不影响其他
    pub async fn pull_all(&self) -> HashMap<EntityKind, Result<DedupReport>> {
        let mut reports = HashMap::new();
        for kind in EntityKind::PULLABLE {
            reports.insert(kind, self.pull_from_server(kind).await);
        }
        reports
    }
}
