//! 本地存储 - 离线记录的持久化入口
//!
//! `LocalStore` 是 DB Actor 的薄封装，`StoreHandle` 负责带看门狗的单次打开。

use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncSdkError};
use crate::storage::db_actor::DbActorHandle;
use crate::storage::entities::{EntityKind, IndexQuery, Record};

/// get_all 每页读取的记录数
const PAGE_SIZE: usize = 100;

/// 本地数据库文件名
pub const DB_FILE_NAME: &str = "audit_sync.db";

/// 惰性、可重新开始的记录流
pub type RecordStream = BoxStream<'static, Result<Record>>;

/// 本地记录存储（可克隆，内部共享同一个 DB Actor）
#[derive(Debug, Clone)]
pub struct LocalStore {
    db: DbActorHandle,
}

impl LocalStore {
    /// 打开数据库（None 为内存库）
    pub async fn open(db_path: Option<PathBuf>) -> Result<Self> {
        if let Some(path) = &db_path {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            info!("打开本地存储: {}", path.display());
        }
        let db = DbActorHandle::spawn(db_path).await?;
        Ok(Self { db })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(None).await
    }

    /// 保存记录：local_id 为 0 或不存在时插入，否则覆盖。返回 local_id。
    pub async fn put(&self, record: Record) -> Result<i64> {
        let kind = record.kind();
        self.db.put(kind, record).await
    }

    pub async fn put_many(&self, kind: EntityKind, records: Vec<Record>) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.db.put_many(kind, records).await
    }

    pub async fn get(&self, kind: EntityKind, local_id: i64) -> Result<Option<Record>> {
        self.db.get(kind, local_id).await
    }

    /// 按 local_id 顺序分页遍历整张表
    ///
    /// 每页都重新读取当前数据，多次调用互不影响；流被丢弃时不会留下任何状态。
    pub fn get_all(&self, kind: EntityKind) -> RecordStream {
        let db = self.db.clone();
        stream::unfold(Some(0i64), move |cursor| {
            let db = db.clone();
            async move {
                let after = cursor?;
                match db.page(kind, after, PAGE_SIZE).await {
                    Ok(page) => {
                        let next = if page.len() < PAGE_SIZE {
                            None
                        } else {
                            page.last().map(|r| r.local_id)
                        };
                        Some((stream::iter(page.into_iter().map(Ok)).boxed(), next))
                    }
                    Err(e) => Some((stream::once(async move { Err(e) }).boxed(), None)),
                }
            }
        })
        .flatten()
        .boxed()
    }

    /// 把 get_all 收集成 Vec
    pub async fn get_all_vec(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let mut stream = self.get_all(kind);
        let mut records = Vec::new();
        while let Some(record) = stream.next().await {
            records.push(record?);
        }
        Ok(records)
    }

    pub async fn get_by_index(&self, kind: EntityKind, query: IndexQuery) -> Result<Vec<Record>> {
        self.db.by_index(kind, query).await
    }

    /// 删除记录，不存在时什么也不做
    pub async fn delete(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        if !self.db.delete(kind, local_id).await? {
            debug!("delete {} local_id={}: 记录不存在", kind, local_id);
        }
        Ok(())
    }

    pub async fn delete_many(&self, kind: EntityKind, local_ids: Vec<i64>) -> Result<usize> {
        if local_ids.is_empty() {
            return Ok(0);
        }
        self.db.delete_many(kind, local_ids).await
    }

    pub async fn count(&self, kind: EntityKind) -> Result<usize> {
        self.db.count(kind).await
    }

    /// 待推送记录：没有 server_id，状态为 Pending 或 Failed，按 local_id 升序
    pub async fn pending(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.db.pending(kind).await
    }

    /// 把记录标记为 Syncing；返回 false 表示记录已被其他同步占用或已不可推送
    pub async fn claim_for_sync(&self, kind: EntityKind, local_id: i64) -> Result<bool> {
        self.db.claim(kind, local_id).await
    }

    pub async fn mark_failed(&self, kind: EntityKind, local_id: i64, error: impl Into<String>) -> Result<()> {
        self.db.mark_failed(kind, local_id, error.into()).await
    }

    /// Syncing → Pending，不记失败
    pub async fn release(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        self.db.release(kind, local_id).await
    }

    /// 手动重试：Failed → Pending 并清掉错误信息
    pub async fn reset_to_pending(&self, kind: EntityKind, local_id: Option<i64>) -> Result<usize> {
        self.db.reset_to_pending(kind, local_id).await
    }

    /// 服务端已确认创建：稽核的子记录改挂到 `server_id`，然后删除本地副本。
    ///
    /// 两步在同一事务内完成，返回改挂的子记录数。
    pub async fn confirm(&self, kind: EntityKind, local_id: i64, server_id: i64) -> Result<usize> {
        self.db.confirm(kind, local_id, server_id).await
    }

    pub async fn clear(&self, kind: EntityKind) -> Result<usize> {
        self.db.clear(kind).await
    }

    pub fn shutdown(&self) {
        self.db.shutdown();
    }
}

/// 带超时看门狗执行打开操作
///
/// 超时后取消令牌，返回 `Timeout`，被放弃的打开操作随之被丢弃。
pub(crate) async fn open_with_watchdog<F>(open: F, timeout: Duration) -> Result<LocalStore>
where
    F: Future<Output = Result<LocalStore>>,
{
    let watchdog = CancellationToken::new();
    let timer = {
        let watchdog = watchdog.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            watchdog.cancel();
        })
    };

    let result = tokio::select! {
        result = open => result,
        _ = watchdog.cancelled() => {
            warn!("打开本地存储超时（{} ms），稍后重试", timeout.as_millis());
            Err(SyncSdkError::Timeout(format!("打开本地存储超过 {} ms", timeout.as_millis())))
        }
    };
    timer.abort();
    result
}

/// 本地存储句柄：并发调用共享同一次打开，打开失败或超时后下一次调用重新尝试
#[derive(Debug)]
pub struct StoreHandle {
    db_path: Option<PathBuf>,
    open_timeout: Duration,
    store: OnceCell<LocalStore>,
}

impl StoreHandle {
    pub fn new(db_path: Option<PathBuf>, open_timeout: Duration) -> Self {
        Self {
            db_path,
            open_timeout,
            store: OnceCell::new(),
        }
    }

    pub async fn get_or_open(&self) -> Result<LocalStore> {
        self.get_or_open_with(LocalStore::open(self.db_path.clone())).await
    }

    /// 用给定的打开操作初始化；已经打开时直接返回，`open` 不会被执行
    pub(crate) async fn get_or_open_with<F>(&self, open: F) -> Result<LocalStore>
    where
        F: Future<Output = Result<LocalStore>>,
    {
        let store = self
            .store
            .get_or_try_init(|| open_with_watchdog(open, self.open_timeout))
            .await?;
        Ok(store.clone())
    }

    pub fn is_open(&self) -> bool {
        self.store.initialized()
    }

    pub fn shutdown(&self) {
        if let Some(store) = self.store.get() {
            store.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{ParentRef, RecordPayload, SyncStatus};
    use bytes::Bytes;
    use tokio_test::{assert_err, assert_ok};

    fn article(title: &str) -> Record {
        Record::new_pending(RecordPayload::Article { title: title.into(), content: "body".into() })
    }

    fn audit(title: &str) -> Record {
        Record::new_pending(RecordPayload::Audit {
            title: title.into(),
            site: None,
            auditor: None,
            category_id: None,
            scheduled_for: None,
        })
    }

    fn evaluation(parent: ParentRef, point_id: i64) -> Record {
        Record::new_pending(RecordPayload::Evaluation {
            audit: parent,
            point_id,
            answer: "conforme".into(),
            score: Some(1.0),
            comment: None,
        })
    }

    #[tokio::test]
    async fn test_put_assigns_increasing_ids_and_overwrites() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let a = store.put(article("A")).await.unwrap();
        let b = store.put(article("B")).await.unwrap();
        assert!(b > a);

        let mut stored = store.get(EntityKind::Article, a).await.unwrap().unwrap();
        stored.payload = RecordPayload::Article { title: "A2".into(), content: "x".into() };
        assert_eq!(store.put(stored).await.unwrap(), a);

        let reread = store.get(EntityKind::Article, a).await.unwrap().unwrap();
        assert_eq!(reread.payload.match_key(), "A2");
        assert_eq!(store.count(EntityKind::Article).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_local_ids_not_reused_after_delete() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let a = store.put(article("A")).await.unwrap();
        store.delete(EntityKind::Article, a).await.unwrap();
        // 删除不存在的记录是 no-op
        assert_ok!(store.delete(EntityKind::Article, a).await);
        let b = store.put(article("B")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_store() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let err = store.put_many(EntityKind::Audit, vec![article("A")]).await;
        assert!(matches!(err, Err(SyncSdkError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_server_id_forces_synced_status() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut record = article("A");
        record.server_id = Some(42);
        let id = store.put(record).await.unwrap();
        let stored = store.get(EntityKind::Article, id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(store.pending(EntityKind::Article).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_all_pages_through_everything() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let records: Vec<Record> = (0..(PAGE_SIZE * 2 + 5)).map(|i| article(&format!("T{}", i))).collect();
        store.put_many(EntityKind::Article, records).await.unwrap();

        let all = store.get_all_vec(EntityKind::Article).await.unwrap();
        assert_eq!(all.len(), PAGE_SIZE * 2 + 5);
        assert!(all.windows(2).all(|w| w[0].local_id < w[1].local_id));

        // 两个流互不影响
        let mut first = store.get_all(EntityKind::Article);
        let mut second = store.get_all(EntityKind::Article);
        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_eq!(a.local_id, b.local_id);
    }

    #[tokio::test]
    async fn test_get_all_empty_store() {
        let store = LocalStore::open_in_memory().await.unwrap();
        assert!(store.get_all_vec(EntityKind::Audit).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = store.put(article("A")).await.unwrap();

        assert!(store.claim_for_sync(EntityKind::Article, id).await.unwrap());
        assert!(!store.claim_for_sync(EntityKind::Article, id).await.unwrap());
        assert!(store.pending(EntityKind::Article).await.unwrap().is_empty());

        store.release(EntityKind::Article, id).await.unwrap();
        assert!(store.claim_for_sync(EntityKind::Article, id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resave_keeps_claimed_record_syncing() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = store.put(article("A")).await.unwrap();
        assert!(store.claim_for_sync(EntityKind::Article, id).await.unwrap());

        // 同步进行中界面又保存了一次
        let mut edited = store.get(EntityKind::Article, id).await.unwrap().unwrap();
        edited.payload = RecordPayload::Article { title: "A".into(), content: "edited".into() };
        edited.sync_status = SyncStatus::Pending;
        store.put(edited).await.unwrap();

        assert!(!store.claim_for_sync(EntityKind::Article, id).await.unwrap());
        let record = store.get(EntityKind::Article, id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Syncing);
        assert_eq!(record.payload, RecordPayload::Article { title: "A".into(), content: "edited".into() });

        // 释放后恢复可同步
        store.release(EntityKind::Article, id).await.unwrap();
        assert!(store.claim_for_sync(EntityKind::Article, id).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_stays_eligible_and_reset_clears_error() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let id = store.put(article("A")).await.unwrap();
        assert!(store.claim_for_sync(EntityKind::Article, id).await.unwrap());
        store.mark_failed(EntityKind::Article, id, "HTTP 500").await.unwrap();

        let failed = store.get(EntityKind::Article, id).await.unwrap().unwrap();
        assert_eq!(failed.sync_status, SyncStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 500"));
        assert_eq!(store.pending(EntityKind::Article).await.unwrap().len(), 1);

        assert_eq!(store.reset_to_pending(EntityKind::Article, None).await.unwrap(), 1);
        let reset = store.get(EntityKind::Article, id).await.unwrap().unwrap();
        assert_eq!(reset.sync_status, SyncStatus::Pending);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn test_confirm_audit_reparents_children() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let audit_id = store.put(audit("Audit cuisine")).await.unwrap();
        store.put(evaluation(ParentRef::Local(audit_id), 1)).await.unwrap();
        store.put(evaluation(ParentRef::Local(audit_id), 2)).await.unwrap();
        store
            .put(Record::new_pending(RecordPayload::document(
                ParentRef::Local(audit_id),
                Some(1),
                "photo.jpg",
                "image/jpeg",
                Bytes::from_static(b"jpeg"),
            )))
            .await
            .unwrap();

        let reparented = store.confirm(EntityKind::Audit, audit_id, 500).await.unwrap();
        assert_eq!(reparented, 3);
        assert!(store.get(EntityKind::Audit, audit_id).await.unwrap().is_none());

        let evals = store
            .get_by_index(EntityKind::Evaluation, IndexQuery::ParentAudit(ParentRef::Server(500)))
            .await
            .unwrap();
        assert_eq!(evals.len(), 2);
        assert!(store
            .get_by_index(EntityKind::Evaluation, IndexQuery::ParentAudit(ParentRef::Local(audit_id)))
            .await
            .unwrap()
            .is_empty());

        let docs = store.get_all_vec(EntityKind::Document).await.unwrap();
        assert_eq!(docs[0].payload.parent(), Some(ParentRef::Server(500)));
        assert_eq!(docs[0].payload.blob().unwrap().as_ref(), b"jpeg");
    }

    #[tokio::test]
    async fn test_index_by_server_id() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut record = article("A");
        record.server_id = Some(42);
        store.put(record.clone()).await.unwrap();
        store.put(record).await.unwrap();
        store.put(article("B")).await.unwrap();

        let dupes = store.get_by_index(EntityKind::Article, IndexQuery::ServerId(42)).await.unwrap();
        assert_eq!(dupes.len(), 2);
        let pending = store
            .get_by_index(EntityKind::Article, IndexQuery::SyncStatus(SyncStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_recovers_interrupted_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE_NAME);

        let store = LocalStore::open(Some(path.clone())).await.unwrap();
        let id = store.put(article("A")).await.unwrap();
        assert!(store.claim_for_sync(EntityKind::Article, id).await.unwrap());
        store.shutdown();
        // 等待 actor 线程退出并释放连接
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reopened = LocalStore::open(Some(path)).await.unwrap();
        let record = reopened.get(EntityKind::Article, id).await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_store_handle_memoizes_open() {
        let dir = tempfile::tempdir().unwrap();
        let handle = StoreHandle::new(Some(dir.path().join(DB_FILE_NAME)), Duration::from_secs(5));
        assert!(!handle.is_open());

        let (a, b) = tokio::join!(handle.get_or_open(), handle.get_or_open());
        let (a, b) = (a.unwrap(), b.unwrap());
        let id = a.put(article("A")).await.unwrap();
        assert!(b.get(EntityKind::Article, id).await.unwrap().is_some());
        assert!(handle.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_times_out_hanging_open() {
        let result = open_with_watchdog(std::future::pending(), Duration::from_millis(100)).await;
        assert!(matches!(result, Err(SyncSdkError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_handle_retries_after_timeout() {
        let handle = StoreHandle::new(None, Duration::from_millis(100));

        let first = handle.get_or_open_with(std::future::pending()).await;
        assert!(matches!(first, Err(SyncSdkError::Timeout(_))));
        assert!(!handle.is_open());

        // 打开走真实的 DB 线程，恢复时钟以免超时被自动推进
        tokio::time::resume();
        let store = assert_ok!(handle.get_or_open().await);
        assert!(handle.is_open());
        let id = store.put(article("A")).await.unwrap();

        // 已打开后不再执行新的打开操作
        let again = assert_ok!(handle.get_or_open_with(std::future::pending()).await);
        assert!(again.get(EntityKind::Article, id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watchdog_passes_through_errors() {
        let result = open_with_watchdog(
            async { Err(SyncSdkError::Storage("disk full".into())) },
            Duration::from_secs(1),
        )
        .await;
        assert_err!(result);
    }
}
