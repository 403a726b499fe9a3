//! 统一 SDK 接口 - AuditSyncSDK 主入口
//!
//! 分层结构：
//! ```text
//! AuditSyncSDK (业务入口)
//!   ├── StoreHandle / LocalStore (本地存储层)
//!   ├── SyncMetaStore (同步元数据)
//!   ├── ConnectivityMonitor (网络监控层)
//!   ├── EventManager (事件系统层)
//!   ├── SyncCoordinator (同步协调层)
//!   └── AutoSyncRunner (网络恢复自动同步)
//! ```
//!
//! 所有写操作先落本地再尝试推送；离线时数据只在本地累积，恢复联网后自动补推。

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SyncSdkError};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SyncEvent};
use crate::network::{ConnectivityMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
use crate::remote::{HttpRemoteApi, RemoteApi};
use crate::storage::entities::{EntityKind, IndexQuery, ParentRef, Record, RecordPayload};
use crate::storage::kv::SyncMetaStore;
use crate::storage::local_store::{LocalStore, StoreHandle, DB_FILE_NAME};
use crate::sync::auto_sync::AutoSyncRunner;
use crate::sync::coordinator::{CoordinatorConfig, RecordOutcome, SyncCoordinator, SyncSummary};
use crate::sync::dedup::DedupReport;
use crate::sync::retry_policy::RetryPolicy;

/// 默认网络状态监听器（假设网络始终在线）
/// 实际应用应该由平台层提供真实的网络状态监听
#[derive(Debug)]
struct AlwaysOnlineListener {
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl Default for AlwaysOnlineListener {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }
}

#[async_trait]
impl NetworkStatusListener for AlwaysOnlineListener {
    async fn get_current_status(&self) -> NetworkStatus {
        NetworkStatus::Online
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

/// 各实体在服务端的接口路径
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub articles: String,
    pub audits: String,
    pub audit_points: String,
    pub evaluations: String,
    pub documents: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            articles: "/api/articles".to_string(),
            audits: "/api/audits".to_string(),
            audit_points: "/api/audit-points".to_string(),
            evaluations: "/api/evaluations".to_string(),
            documents: "/api/documents".to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn path(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Article => &self.articles,
            EntityKind::Audit => &self.audits,
            EntityKind::AuditPoint => &self.audit_points,
            EntityKind::Evaluation => &self.evaluations,
            EntityKind::Document => &self.documents,
        }
    }
}

/// HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// 连接超时时间（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时时间（秒）
    pub request_timeout_secs: Option<u64>,
    /// User-Agent
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(10),
            request_timeout_secs: Some(60),
            user_agent: Some(format!("audit-sync-sdk/{}", crate::version::SDK_VERSION)),
        }
    }
}

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 数据目录；None 时使用内存库（测试用）
    pub data_dir: Option<PathBuf>,
    /// 服务端地址
    pub server_base_url: String,
    pub endpoints: EndpointConfig,
    pub http_client_config: HttpClientConfig,
    /// 服务端暂时不可用时的重试配置
    pub retry_config: RetryPolicy,
    /// 两条记录推送之间的间隔（毫秒）
    pub inter_record_delay_ms: u64,
    /// 网络恢复后等待多久再开始自动同步（毫秒）
    pub settle_delay_ms: u64,
    /// 打开本地存储的超时（毫秒）
    pub store_open_timeout_ms: u64,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 响应无法解析且兜底查询找不到时，是否当作已提交
    pub optimistic_unknown_outcome: bool,
    /// 创建失败后的兜底查询只按标题匹配，不取最新一条
    pub title_only_fallback: bool,
    /// 网络恢复时是否自动同步
    pub auto_sync: bool,
    /// 调试模式（输出 debug 级别日志）
    pub debug_mode: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            server_base_url: String::new(),
            endpoints: EndpointConfig::default(),
            http_client_config: HttpClientConfig::default(),
            retry_config: RetryPolicy::default(),
            inter_record_delay_ms: 500,
            settle_delay_ms: 2000,
            store_open_timeout_ms: 10_000,
            event_buffer_size: 256,
            optimistic_unknown_outcome: false,
            title_only_fallback: false,
            auto_sync: true,
            debug_mode: false,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从 JSON 文件读取配置，缺省字段取默认值
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncSdkError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .map_err(|e| SyncSdkError::Config(format!("解析配置文件失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_base_url.is_empty() {
            return Err(SyncSdkError::Config("server_base_url 不能为空".to_string()));
        }
        if !self.server_base_url.starts_with("http://") && !self.server_base_url.starts_with("https://") {
            return Err(SyncSdkError::Config(format!(
                "server_base_url 必须以 http:// 或 https:// 开头: {}",
                self.server_base_url
            )));
        }
        if self.event_buffer_size == 0 {
            return Err(SyncSdkError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        if self.store_open_timeout_ms == 0 {
            return Err(SyncSdkError::Config("store_open_timeout_ms 必须大于 0".to_string()));
        }
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            inter_record_delay_ms: self.inter_record_delay_ms,
            retry_policy: self.retry_config.clone(),
            optimistic_unknown_outcome: self.optimistic_unknown_outcome,
            title_only_fallback: self.title_only_fallback,
        }
    }

    fn db_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(DB_FILE_NAME))
    }

    fn kv_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("kv"))
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn server_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.server_base_url = url.into();
        self
    }

    pub fn endpoints(mut self, endpoints: EndpointConfig) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    pub fn http_client_config(mut self, config: HttpClientConfig) -> Self {
        self.config.http_client_config = config;
        self
    }

    pub fn retry_config(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_config = policy;
        self
    }

    pub fn inter_record_delay_ms(mut self, delay: u64) -> Self {
        self.config.inter_record_delay_ms = delay;
        self
    }

    pub fn settle_delay_ms(mut self, delay: u64) -> Self {
        self.config.settle_delay_ms = delay;
        self
    }

    pub fn store_open_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.store_open_timeout_ms = timeout;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn optimistic_unknown_outcome(mut self, enabled: bool) -> Self {
        self.config.optimistic_unknown_outcome = enabled;
        self
    }

    pub fn title_only_fallback(mut self, enabled: bool) -> Self {
        self.config.title_only_fallback = enabled;
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// 离线优先同步 SDK
pub struct AuditSyncSDK {
    config: SyncConfig,
    store_handle: StoreHandle,
    store: LocalStore,
    meta: SyncMetaStore,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    coordinator: Arc<SyncCoordinator>,
    auto_sync: AutoSyncRunner,
    shutting_down: RwLock<bool>,
}

impl std::fmt::Debug for AuditSyncSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSyncSDK")
            .field("data_dir", &self.config.data_dir)
            .field("server_base_url", &self.config.server_base_url)
            .finish()
    }
}

impl AuditSyncSDK {
    /// 用默认网络监听器（始终在线）和 HTTP 服务端初始化
    pub async fn initialize(config: SyncConfig) -> Result<Arc<Self>> {
        Self::initialize_with(config, Arc::new(AlwaysOnlineListener::default()), None).await
    }

    /// 指定网络监听器；`remote` 为 None 时按配置创建 HTTP 客户端
    pub async fn initialize_with(
        config: SyncConfig,
        listener: Arc<dyn NetworkStatusListener>,
        remote: Option<Arc<dyn RemoteApi>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if config.debug_mode {
            crate::logging::init_tracing(true);
        }
        info!("正在初始化 AuditSyncSDK {}...", crate::version::version_string());

        debug!("=== 第1层：本地存储 ===");
        let store_handle = StoreHandle::new(
            config.db_path(),
            Duration::from_millis(config.store_open_timeout_ms),
        );
        let store = store_handle.get_or_open().await?;
        let meta = match config.kv_path() {
            Some(path) => SyncMetaStore::open(&path).await?,
            None => SyncMetaStore::temporary()?,
        };

        debug!("=== 第2层：网络监控 ===");
        let monitor = Arc::new(ConnectivityMonitor::with_capacity(listener, config.event_buffer_size));
        monitor.start().await?;

        debug!("=== 第3层：事件系统 ===");
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        debug!("=== 第4层：同步协调 ===");
        let remote: Arc<dyn RemoteApi> = match remote {
            Some(remote) => remote,
            None => Arc::new(HttpRemoteApi::new(
                config.server_base_url.clone(),
                config.endpoints.clone(),
                &config.http_client_config,
            )?),
        };
        let coordinator = Arc::new(
            SyncCoordinator::new(
                store.clone(),
                remote,
                monitor.clone(),
                events.clone(),
                config.coordinator_config(),
            )
            .with_meta_store(meta.clone()),
        );

        let auto_sync = AutoSyncRunner::new(
            coordinator.clone(),
            monitor.clone(),
            events.clone(),
            Duration::from_millis(config.settle_delay_ms),
        );
        if config.auto_sync {
            auto_sync.start().await;
        }

        info!("✅ AuditSyncSDK 初始化完成 (online={})", monitor.is_online());
        Ok(Arc::new(Self {
            config,
            store_handle,
            store,
            meta,
            monitor,
            events,
            coordinator,
            auto_sync,
            shutting_down: RwLock::new(false),
        }))
    }

    async fn ensure_running(&self) -> Result<()> {
        if *self.shutting_down.read().await {
            return Err(SyncSdkError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    // ========== 保存 ==========

    /// 保存记录并在在线时立即尝试推送；返回 local_id
    ///
    /// 推送在后台进行，结果通过 `RecordSynced` / `RecordSyncFailed` 事件通知。
    pub async fn save_record(&self, payload: RecordPayload) -> Result<i64> {
        self.ensure_running().await?;
        let kind = payload.kind();
        if !kind.is_pushable() {
            return Err(SyncSdkError::InvalidArgument(format!("{} 只能从服务端拉取", kind)));
        }

        let local_id = self.store.put(Record::new_pending(payload)).await?;
        debug!("已保存 {} local_id={}", kind, local_id);
        self.events.emit(SyncEvent::record_saved(kind, local_id)).await;

        if self.monitor.is_online() {
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.sync_one(kind, local_id).await {
                    warn!("即时推送 {} local_id={} 失败: {}", kind, local_id, e);
                }
            });
        }
        Ok(local_id)
    }

    pub async fn save_article(&self, title: impl Into<String>, content: impl Into<String>) -> Result<i64> {
        self.save_record(RecordPayload::Article {
            title: title.into(),
            content: content.into(),
        })
        .await
    }

    pub async fn save_audit(
        &self,
        title: impl Into<String>,
        site: Option<String>,
        auditor: Option<String>,
        category_id: Option<i64>,
    ) -> Result<i64> {
        self.save_record(RecordPayload::Audit {
            title: title.into(),
            site,
            auditor,
            category_id,
            scheduled_for: None,
        })
        .await
    }

    pub async fn save_evaluation(
        &self,
        audit: ParentRef,
        point_id: i64,
        answer: impl Into<String>,
        score: Option<f64>,
        comment: Option<String>,
    ) -> Result<i64> {
        self.save_record(RecordPayload::Evaluation {
            audit,
            point_id,
            answer: answer.into(),
            score,
            comment,
        })
        .await
    }

    pub async fn save_document(
        &self,
        audit: ParentRef,
        point_id: Option<i64>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Bytes,
    ) -> Result<i64> {
        self.save_record(RecordPayload::document(audit, point_id, filename, mime_type, bytes))
            .await
    }

    // ========== 同步 ==========

    pub async fn sync_all(&self) -> Result<SyncSummary> {
        self.ensure_running().await?;
        self.coordinator.sync_all().await
    }

    pub async fn sync_one(&self, kind: EntityKind, local_id: i64) -> Result<RecordOutcome> {
        self.ensure_running().await?;
        self.coordinator.sync_one(kind, local_id).await
    }

    pub async fn pull_from_server(&self, kind: EntityKind) -> Result<DedupReport> {
        self.ensure_running().await?;
        self.coordinator.pull_from_server(kind).await
    }

    pub async fn pull_all(&self) -> Result<HashMap<EntityKind, Result<DedupReport>>> {
        self.ensure_running().await?;
        Ok(self.coordinator.pull_all().await)
    }

    /// 把所有失败记录重置为待同步，然后执行一轮同步
    pub async fn retry_failed(&self) -> Result<SyncSummary> {
        self.ensure_running().await?;
        let mut reset = 0;
        for kind in EntityKind::PUSH_ORDER {
            reset += self.store.reset_to_pending(kind, None).await?;
        }
        info!("🔁 重置 {} 条失败记录", reset);
        self.coordinator.sync_all().await
    }

    /// 重试单条失败记录
    pub async fn retry_record(&self, kind: EntityKind, local_id: i64) -> Result<RecordOutcome> {
        self.ensure_running().await?;
        self.store.reset_to_pending(kind, Some(local_id)).await?;
        self.coordinator.sync_one(kind, local_id).await
    }

    // ========== 查询 ==========

    /// 各类型待推送（含失败）的记录数
    pub async fn pending_counts(&self) -> Result<BTreeMap<EntityKind, usize>> {
        let mut counts = BTreeMap::new();
        for kind in EntityKind::PUSH_ORDER {
            counts.insert(kind, self.store.pending(kind).await?.len());
        }
        Ok(counts)
    }

    pub async fn records(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.store.get_all_vec(kind).await
    }

    /// 某个稽核下的本地子记录
    pub async fn children_of(&self, kind: EntityKind, audit: ParentRef) -> Result<Vec<Record>> {
        self.store.get_by_index(kind, IndexQuery::ParentAudit(audit)).await
    }

    pub fn last_summary(&self) -> Result<Option<SyncSummary>> {
        self.meta.last_summary()
    }

    pub fn last_pull_at(&self, kind: EntityKind) -> Result<Option<i64>> {
        self.meta.last_pull_at(kind)
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.monitor.get_status()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // ========== 事件 ==========

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    // ========== 生命周期 ==========

    /// 关闭 SDK：停止自动同步和网络监听，刷新元数据，关闭数据库
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut shutting_down = self.shutting_down.write().await;
            if *shutting_down {
                return Ok(());
            }
            *shutting_down = true;
        }
        info!("正在关闭 AuditSyncSDK...");

        self.auto_sync.stop().await;
        self.monitor.stop().await;
        if let Err(e) = self.meta.flush().await {
            error!("刷新同步元数据失败: {}", e);
        }
        self.store_handle.shutdown();

        info!("AuditSyncSDK 关闭完成");
        Ok(())
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ScriptedNetworkListener;
    use crate::storage::entities::SyncStatus;
    use crate::test_helpers::MockRemoteApi;
    use tokio_test::assert_err;

    fn test_config(data_dir: Option<&Path>) -> SyncConfig {
        let mut builder = SyncConfig::builder()
            .server_base_url("http://127.0.0.1:1")
            .inter_record_delay_ms(0)
            .settle_delay_ms(10)
            .retry_config(RetryPolicy::none());
        if let Some(dir) = data_dir {
            builder = builder.data_dir(dir);
        }
        builder.build().unwrap()
    }

    async fn wait_for(rx: &mut broadcast::Receiver<SyncEvent>, event_type: &str) -> Option<SyncEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(event)) if event.event_type() == event_type => return Some(event),
                Ok(Ok(_)) => continue,
                _ => return None,
            }
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::builder().build().is_err());
        assert!(SyncConfig::builder().server_base_url("ftp://host").build().is_err());
        assert!(SyncConfig::builder()
            .server_base_url("https://audit.example.com")
            .event_buffer_size(0)
            .build()
            .is_err());
        let config = SyncConfig::builder()
            .server_base_url("https://audit.example.com")
            .build()
            .unwrap();
        assert_eq!(config.inter_record_delay_ms, 500);
        assert!(!config.optimistic_unknown_outcome);
        assert!(!config.coordinator_config().title_only_fallback);

        let config = SyncConfig::builder()
            .server_base_url("https://audit.example.com")
            .title_only_fallback(true)
            .build()
            .unwrap();
        assert!(config.coordinator_config().title_only_fallback);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(
            &path,
            r#"{"server_base_url": "https://audit.example.com", "settle_delay_ms": 500,
                "endpoints": {"audits": "/v2/audits"}}"#,
        )
        .unwrap();

        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.settle_delay_ms, 500);
        assert_eq!(config.endpoints.path(EntityKind::Audit), "/v2/audits");
        assert_eq!(config.endpoints.path(EntityKind::Article), "/api/articles");
        assert_eq!(config.store_open_timeout_ms, 10_000);

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(SyncConfig::from_json_file(&path), Err(SyncSdkError::Config(_))));
    }

    #[tokio::test]
    async fn test_save_online_pushes_immediately() {
        let remote = Arc::new(MockRemoteApi::new());
        let sdk = AuditSyncSDK::initialize_with(
            test_config(None),
            Arc::new(ScriptedNetworkListener::online()),
            Some(remote.clone()),
        )
        .await
        .unwrap();
        let mut rx = sdk.subscribe_events();

        let local_id = sdk.save_article("T1", "C1").await.unwrap();
        assert!(wait_for(&mut rx, "record_saved").await.is_some());
        match wait_for(&mut rx, "record_synced").await {
            Some(SyncEvent::RecordSynced { local_id: id, .. }) => assert_eq!(id, local_id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(remote.create_calls("T1"), 1);
        assert!(sdk.records(EntityKind::Article).await.unwrap().is_empty());
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_offline_then_reconnect() {
        let listener = Arc::new(ScriptedNetworkListener::offline());
        let remote = Arc::new(MockRemoteApi::new());
        let sdk = AuditSyncSDK::initialize_with(test_config(None), listener.clone(), Some(remote.clone()))
            .await
            .unwrap();
        let mut rx = sdk.subscribe_events();

        sdk.save_article("T1", "C1").await.unwrap();
        sdk.save_audit("Audit A", Some("Site 1".into()), None, None).await.unwrap();
        let counts = sdk.pending_counts().await.unwrap();
        assert_eq!(counts[&EntityKind::Article], 1);
        assert_eq!(counts[&EntityKind::Audit], 1);
        assert_eq!(remote.total_calls(), 0);

        listener.set(NetworkStatus::Online);
        assert!(wait_for(&mut rx, "pass_completed").await.is_some());
        let counts = sdk.pending_counts().await.unwrap();
        assert!(counts.values().all(|c| *c == 0));
        assert!(sdk.last_summary().unwrap().is_some());
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_sync_recovers_after_transport_error() {
        let remote = Arc::new(MockRemoteApi::new());
        remote.push_create(EntityKind::Article, Err(SyncSdkError::Network("connection reset".into())));
        let sdk = AuditSyncSDK::initialize_with(
            test_config(None),
            Arc::new(ScriptedNetworkListener::online()),
            Some(remote.clone()),
        )
        .await
        .unwrap();
        let mut rx = sdk.subscribe_events();

        sdk.save_article("T1", "C1").await.unwrap();
        assert!(wait_for(&mut rx, "connectivity_changed").await.is_some());
        assert!(!sdk.is_online());

        // 平台从未报告离线，手动同步按平台状态恢复在线
        sdk.sync_all().await.unwrap();
        assert!(wait_for(&mut rx, "record_synced").await.is_some());
        assert!(sdk.is_online());
        assert_eq!(remote.create_calls("T1"), 2);
        assert!(sdk.pending_counts().await.unwrap().values().all(|c| *c == 0));
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_audit_points_cannot_be_saved() {
        let sdk = AuditSyncSDK::initialize_with(
            test_config(None),
            Arc::new(ScriptedNetworkListener::offline()),
            Some(Arc::new(MockRemoteApi::new())),
        )
        .await
        .unwrap();

        let result = sdk
            .save_record(RecordPayload::AuditPoint {
                audit: ParentRef::Server(1),
                label: "P1".into(),
                position: 0,
            })
            .await;
        assert!(matches!(result, Err(SyncSdkError::InvalidArgument(_))));
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_failed_resets_and_syncs() {
        let remote = Arc::new(MockRemoteApi::new());
        let sdk = AuditSyncSDK::initialize_with(
            test_config(None),
            Arc::new(ScriptedNetworkListener::offline()),
            Some(remote.clone()),
        )
        .await
        .unwrap();

        let local_id = sdk.save_article("T1", "C1").await.unwrap();
        sdk.store().mark_failed(EntityKind::Article, local_id, "HTTP 500").await.unwrap();
        let record = sdk.store().get(EntityKind::Article, local_id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);

        // 离线：只重置状态，不发请求
        let summary = sdk.retry_failed().await.unwrap();
        assert!(summary.skipped_offline);
        let record = sdk.store().get(EntityKind::Article, local_id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(remote.total_calls(), 0);
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_persists_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let listener = Arc::new(ScriptedNetworkListener::offline());
        {
            let sdk = AuditSyncSDK::initialize_with(
                test_config(Some(dir.path())),
                listener.clone(),
                Some(Arc::new(MockRemoteApi::new())),
            )
            .await
            .unwrap();
            sdk.save_article("T1", "C1").await.unwrap();
            sdk.shutdown().await.unwrap();
        }
        // 等待 sled 文件锁释放
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sdk = AuditSyncSDK::initialize_with(
            test_config(Some(dir.path())),
            listener,
            Some(Arc::new(MockRemoteApi::new())),
        )
        .await
        .unwrap();
        let records = sdk.records(EntityKind::Article).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload.match_key(), "T1");
        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_rejected_after_shutdown() {
        let sdk = AuditSyncSDK::initialize_with(
            test_config(None),
            Arc::new(ScriptedNetworkListener::offline()),
            Some(Arc::new(MockRemoteApi::new())),
        )
        .await
        .unwrap();
        sdk.shutdown().await.unwrap();
        sdk.shutdown().await.unwrap();
        assert!(sdk.is_shutting_down().await);
        assert_err!(sdk.save_article("T1", "C1").await);
        assert!(matches!(sdk.sync_all().await, Err(SyncSdkError::ShuttingDown(_))));
    }
}
