//! 数据库 Actor - 单线程数据库访问模型
//!
//! 核心设计：
//! - SQLite Connection 永远只在一个专用线程中
//! - 所有数据库操作通过 channel 发送命令，结果经 oneshot 返回
//! - 调用方只在 await 处挂起，不会阻塞 tokio 运行时

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::{Result, SyncSdkError};
use crate::storage::entities::{EntityKind, IndexQuery, ParentRef, Record, RecordPayload, SyncStatus};
use crate::storage::migrate;

const SELECT_COLUMNS: &str =
    "local_id, server_id, payload, blob, timestamp, sync_status, attempts, last_error";

/// 子记录所在的表（父级确认后需要改挂服务端 ID）
const CHILD_KINDS: [EntityKind; 3] = [EntityKind::AuditPoint, EntityKind::Evaluation, EntityKind::Document];

/// 数据库命令
pub enum DbCommand {
    Put {
        kind: EntityKind,
        record: Record,
        respond_to: oneshot::Sender<Result<i64>>,
    },
    PutMany {
        kind: EntityKind,
        records: Vec<Record>,
        respond_to: oneshot::Sender<Result<Vec<i64>>>,
    },
    Get {
        kind: EntityKind,
        local_id: i64,
        respond_to: oneshot::Sender<Result<Option<Record>>>,
    },
    /// 按 local_id 分页读取（local_id > after）
    Page {
        kind: EntityKind,
        after: i64,
        limit: usize,
        respond_to: oneshot::Sender<Result<Vec<Record>>>,
    },
    ByIndex {
        kind: EntityKind,
        query: IndexQuery,
        respond_to: oneshot::Sender<Result<Vec<Record>>>,
    },
    /// 待推送记录（无 server_id，Pending/Failed）
    Pending {
        kind: EntityKind,
        respond_to: oneshot::Sender<Result<Vec<Record>>>,
    },
    Delete {
        kind: EntityKind,
        local_id: i64,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    DeleteMany {
        kind: EntityKind,
        local_ids: Vec<i64>,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    /// Pending/Failed → Syncing，条件更新，成功返回 true
    Claim {
        kind: EntityKind,
        local_id: i64,
        respond_to: oneshot::Sender<Result<bool>>,
    },
    /// Syncing → Failed，attempts + 1
    MarkFailed {
        kind: EntityKind,
        local_id: i64,
        error: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// Syncing → Pending，不计失败次数（离线中断）
    Release {
        kind: EntityKind,
        local_id: i64,
        respond_to: oneshot::Sender<Result<()>>,
    },
    /// Failed → Pending（手动重试），local_id 为 None 时作用于整张表
    ResetToPending {
        kind: EntityKind,
        local_id: Option<i64>,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    /// 服务端确认：子记录改挂服务端 ID 并删除本地副本（同一事务）
    Confirm {
        kind: EntityKind,
        local_id: i64,
        server_id: i64,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    Count {
        kind: EntityKind,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    Clear {
        kind: EntityKind,
        respond_to: oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

/// 表中一行的原始列值
struct RawRow {
    local_id: i64,
    server_id: Option<i64>,
    payload: String,
    blob: Option<Vec<u8>>,
    timestamp: i64,
    sync_status: i32,
    attempts: i64,
    last_error: Option<String>,
}

impl RawRow {
    fn into_record(self) -> Result<Record> {
        let mut payload: RecordPayload = serde_json::from_str(&self.payload)
            .map_err(|e| SyncSdkError::Storage(format!("记录 {} 载荷损坏: {}", self.local_id, e)))?;
        if let Some(blob) = self.blob {
            payload.attach_blob(Bytes::from(blob));
        }
        let sync_status = SyncStatus::from_i32(self.sync_status).ok_or_else(|| {
            SyncSdkError::Storage(format!("记录 {} 同步状态损坏: {}", self.local_id, self.sync_status))
        })?;
        Ok(Record {
            local_id: self.local_id,
            server_id: self.server_id,
            payload,
            timestamp: self.timestamp,
            sync_status,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error,
        })
    }
}

/// DB Actor（运行在专用线程）
struct DbActor {
    conn: Connection,
    receiver: Receiver<DbCommand>,
}

impl DbActor {
    fn open(db_path: Option<&PathBuf>) -> Result<Connection> {
        let mut conn = match db_path {
            Some(path) => Connection::open(path)
                .map_err(|e| SyncSdkError::Storage(format!("打开数据库失败: {}", e)))?,
            None => Connection::open_in_memory()
                .map_err(|e| SyncSdkError::Storage(format!("打开内存数据库失败: {}", e)))?,
        };
        migrate::init_db(&mut conn)?;
        Ok(conn)
    }

    fn run(self) {
        let thread_id = thread::current().id();
        info!("🔄 [Thread {:?}] DbActor 开始处理命令", thread_id);

        while let Ok(command) = self.receiver.recv() {
            match command {
                DbCommand::Shutdown => {
                    info!("🛑 [Thread {:?}] DbActor 收到停止信号", thread_id);
                    break;
                }
                DbCommand::Put { kind, record, respond_to } => {
                    let _ = respond_to.send(self.handle_put(kind, &record));
                }
                DbCommand::PutMany { kind, records, respond_to } => {
                    let _ = respond_to.send(self.handle_put_many(kind, &records));
                }
                DbCommand::Get { kind, local_id, respond_to } => {
                    let _ = respond_to.send(self.handle_get(kind, local_id));
                }
                DbCommand::Page { kind, after, limit, respond_to } => {
                    let _ = respond_to.send(self.handle_page(kind, after, limit));
                }
                DbCommand::ByIndex { kind, query, respond_to } => {
                    let _ = respond_to.send(self.handle_by_index(kind, query));
                }
                DbCommand::Pending { kind, respond_to } => {
                    let _ = respond_to.send(self.handle_pending(kind));
                }
                DbCommand::Delete { kind, local_id, respond_to } => {
                    let _ = respond_to.send(self.handle_delete(kind, local_id));
                }
                DbCommand::DeleteMany { kind, local_ids, respond_to } => {
                    let _ = respond_to.send(self.handle_delete_many(kind, &local_ids));
                }
                DbCommand::Claim { kind, local_id, respond_to } => {
                    let _ = respond_to.send(self.handle_claim(kind, local_id));
                }
                DbCommand::MarkFailed { kind, local_id, error, respond_to } => {
                    let _ = respond_to.send(self.handle_mark_failed(kind, local_id, &error));
                }
                DbCommand::Release { kind, local_id, respond_to } => {
                    let _ = respond_to.send(self.handle_release(kind, local_id));
                }
                DbCommand::ResetToPending { kind, local_id, respond_to } => {
                    let _ = respond_to.send(self.handle_reset_to_pending(kind, local_id));
                }
                DbCommand::Confirm { kind, local_id, server_id, respond_to } => {
                    let _ = respond_to.send(self.handle_confirm(kind, local_id, server_id));
                }
                DbCommand::Count { kind, respond_to } => {
                    let _ = respond_to.send(self.handle_count(kind));
                }
                DbCommand::Clear { kind, respond_to } => {
                    let _ = respond_to.send(self.handle_clear(kind));
                }
            }
        }

        info!("[Thread {:?}] DbActor 已退出", thread_id);
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            local_id: row.get(0)?,
            server_id: row.get(1)?,
            payload: row.get(2)?,
            blob: row.get(3)?,
            timestamp: row.get(4)?,
            sync_status: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
        })
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn upsert(conn: &Connection, kind: EntityKind, record: &Record) -> Result<i64> {
        if record.payload.kind() != kind {
            return Err(SyncSdkError::InvalidArgument(format!(
                "{} 记录不能写入 {} 表",
                record.payload.kind(),
                kind.store_name()
            )));
        }

        // server_id 非空的记录一律视为已同步；正在同步的行不会被重新保存改回 Pending/Failed
        let status = if record.server_id.is_some() { SyncStatus::Synced } else { record.sync_status };
        let payload_json = serde_json::to_string(&record.payload)?;
        let blob = record.payload.blob().map(|b| b.to_vec());
        let (parent_local, parent_server) = match record.payload.parent() {
            Some(ParentRef::Local(id)) => (Some(id), None),
            Some(ParentRef::Server(id)) => (None, Some(id)),
            None => (None, None),
        };

        let sql = format!(
            "INSERT INTO {table} (local_id, server_id, parent_local_id, parent_server_id, payload, blob, timestamp, sync_status, attempts, last_error)
             VALUES (NULLIF(?1, 0), ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(local_id) DO UPDATE SET
                server_id = excluded.server_id,
                parent_local_id = excluded.parent_local_id,
                parent_server_id = excluded.parent_server_id,
                payload = excluded.payload,
                blob = excluded.blob,
                timestamp = excluded.timestamp,
                sync_status = CASE
                    WHEN {table}.sync_status = 1 AND excluded.sync_status <> 2 THEN 1
                    ELSE excluded.sync_status
                END,
                attempts = excluded.attempts,
                last_error = excluded.last_error",
            table = kind.store_name()
        );
        conn.execute(
            &sql,
            params![
                record.local_id,
                record.server_id,
                parent_local,
                parent_server,
                payload_json,
                blob,
                record.timestamp,
                status as i32,
                record.attempts as i64,
                record.last_error,
            ],
        )?;

        Ok(if record.local_id == 0 { conn.last_insert_rowid() } else { record.local_id })
    }

    fn handle_put(&self, kind: EntityKind, record: &Record) -> Result<i64> {
        let local_id = Self::upsert(&self.conn, kind, record)?;
        debug!("put {} local_id={}", kind.store_name(), local_id);
        Ok(local_id)
    }

    fn handle_put_many(&self, kind: EntityKind, records: &[Record]) -> Result<Vec<i64>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(Self::upsert(&tx, kind, record)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    fn handle_get(&self, kind: EntityKind, local_id: i64) -> Result<Option<Record>> {
        let sql = format!("SELECT {} FROM {} WHERE local_id = ?1", SELECT_COLUMNS, kind.store_name());
        let parts = self
            .conn
            .query_row(&sql, params![local_id], Self::row_to_record)
            .optional()?;
        parts.map(RawRow::into_record).transpose()
    }

    fn handle_page(&self, kind: EntityKind, after: i64, limit: usize) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE local_id > ?1 ORDER BY local_id LIMIT ?2",
            SELECT_COLUMNS,
            kind.store_name()
        );
        self.query_records(&sql, params![after, limit as i64])
    }

    fn handle_by_index(&self, kind: EntityKind, query: IndexQuery) -> Result<Vec<Record>> {
        let (column, value) = match query {
            IndexQuery::ParentAudit(ParentRef::Local(id)) => ("parent_local_id", id),
            IndexQuery::ParentAudit(ParentRef::Server(id)) => ("parent_server_id", id),
            IndexQuery::ServerId(id) => ("server_id", id),
            IndexQuery::SyncStatus(status) => ("sync_status", status as i64),
        };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY local_id",
            SELECT_COLUMNS,
            kind.store_name(),
            column
        );
        self.query_records(&sql, params![value])
    }

    fn handle_pending(&self, kind: EntityKind) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE server_id IS NULL AND sync_status IN (?1, ?2) ORDER BY local_id",
            SELECT_COLUMNS,
            kind.store_name()
        );
        self.query_records(&sql, params![SyncStatus::Pending as i32, SyncStatus::Failed as i32])
    }

    fn handle_delete(&self, kind: EntityKind, local_id: i64) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE local_id = ?1", kind.store_name());
        Ok(self.conn.execute(&sql, params![local_id])? > 0)
    }

    fn handle_delete_many(&self, kind: EntityKind, local_ids: &[i64]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut deleted = 0;
        {
            let sql = format!("DELETE FROM {} WHERE local_id = ?1", kind.store_name());
            let mut stmt = tx.prepare(&sql)?;
            for id in local_ids {
                deleted += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn handle_claim(&self, kind: EntityKind, local_id: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET sync_status = ?1
             WHERE local_id = ?2 AND server_id IS NULL AND sync_status IN (?3, ?4)",
            kind.store_name()
        );
        let updated = self.conn.execute(
            &sql,
            params![
                SyncStatus::Syncing as i32,
                local_id,
                SyncStatus::Pending as i32,
                SyncStatus::Failed as i32
            ],
        )?;
        Ok(updated == 1)
    }

    fn handle_mark_failed(&self, kind: EntityKind, local_id: i64, error: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET sync_status = ?1, attempts = attempts + 1, last_error = ?2
             WHERE local_id = ?3 AND sync_status = ?4",
            kind.store_name()
        );
        self.conn.execute(
            &sql,
            params![SyncStatus::Failed as i32, error, local_id, SyncStatus::Syncing as i32],
        )?;
        Ok(())
    }

    fn handle_release(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET sync_status = ?1 WHERE local_id = ?2 AND sync_status = ?3",
            kind.store_name()
        );
        self.conn.execute(
            &sql,
            params![SyncStatus::Pending as i32, local_id, SyncStatus::Syncing as i32],
        )?;
        Ok(())
    }

    fn handle_reset_to_pending(&self, kind: EntityKind, local_id: Option<i64>) -> Result<usize> {
        let updated = match local_id {
            Some(id) => self.conn.execute(
                &format!(
                    "UPDATE {} SET sync_status = ?1, last_error = NULL WHERE local_id = ?2 AND sync_status = ?3",
                    kind.store_name()
                ),
                params![SyncStatus::Pending as i32, id, SyncStatus::Failed as i32],
            )?,
            None => self.conn.execute(
                &format!(
                    "UPDATE {} SET sync_status = ?1, last_error = NULL WHERE sync_status = ?2",
                    kind.store_name()
                ),
                params![SyncStatus::Pending as i32, SyncStatus::Failed as i32],
            )?,
        };
        Ok(updated)
    }

    fn handle_confirm(&self, kind: EntityKind, local_id: i64, server_id: i64) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut reparented = 0;

        if kind == EntityKind::Audit {
            for child in CHILD_KINDS {
                let select = format!(
                    "SELECT {} FROM {} WHERE parent_local_id = ?1",
                    SELECT_COLUMNS,
                    child.store_name()
                );
                let children = {
                    let mut stmt = tx.prepare(&select)?;
                    let rows = stmt.query_map(params![local_id], Self::row_to_record)?;
                    let mut out = Vec::new();
                    for row in rows {
                        out.push(row?.into_record()?);
                    }
                    out
                };
                for mut child_record in children {
                    child_record.payload.set_parent(ParentRef::Server(server_id));
                    Self::upsert(&tx, child, &child_record)?;
                    reparented += 1;
                }
            }
        }

        tx.execute(
            &format!("DELETE FROM {} WHERE local_id = ?1", kind.store_name()),
            params![local_id],
        )?;
        tx.commit()?;

        if reparented > 0 {
            info!(
                "稽核 local_id={} 已确认为 server_id={}，{} 条子记录已改挂",
                local_id, server_id, reparented
            );
        }
        Ok(reparented)
    }

    fn handle_count(&self, kind: EntityKind) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", kind.store_name());
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn handle_clear(&self, kind: EntityKind) -> Result<usize> {
        let sql = format!("DELETE FROM {}", kind.store_name());
        Ok(self.conn.execute(&sql, [])?)
    }
}

/// DB Actor 句柄（可克隆，所有方法都是 async）
#[derive(Debug, Clone)]
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
}

impl DbActorHandle {
    /// 启动 DB Actor 并等待数据库打开、迁移完成
    ///
    /// `db_path` 为 None 时使用内存数据库（测试用）。
    pub async fn spawn(db_path: Option<PathBuf>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        thread::Builder::new()
            .name("audit-sync-db".to_string())
            .spawn(move || match DbActor::open(db_path.as_ref()) {
                Ok(conn) => {
                    let _ = ready_tx.send(Ok(()));
                    DbActor { conn, receiver }.run();
                }
                Err(e) => {
                    error!("❌ 打开本地数据库失败: {}", e);
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| SyncSdkError::Storage(format!("无法启动 DB Actor 线程: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| SyncSdkError::Storage("DB Actor 启动时退出".to_string()))??;

        Ok(Self { sender })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> DbCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .map_err(|_| SyncSdkError::Storage("DB Actor 已停止".to_string()))?;
        rx.await
            .map_err(|_| SyncSdkError::Storage("DB Actor 响应失败".to_string()))?
    }

    pub async fn put(&self, kind: EntityKind, record: Record) -> Result<i64> {
        self.request(|respond_to| DbCommand::Put { kind, record, respond_to }).await
    }

    pub async fn put_many(&self, kind: EntityKind, records: Vec<Record>) -> Result<Vec<i64>> {
        self.request(|respond_to| DbCommand::PutMany { kind, records, respond_to }).await
    }

    pub async fn get(&self, kind: EntityKind, local_id: i64) -> Result<Option<Record>> {
        self.request(|respond_to| DbCommand::Get { kind, local_id, respond_to }).await
    }

    pub async fn page(&self, kind: EntityKind, after: i64, limit: usize) -> Result<Vec<Record>> {
        self.request(|respond_to| DbCommand::Page { kind, after, limit, respond_to }).await
    }

    pub async fn by_index(&self, kind: EntityKind, query: IndexQuery) -> Result<Vec<Record>> {
        self.request(|respond_to| DbCommand::ByIndex { kind, query, respond_to }).await
    }

    pub async fn pending(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.request(|respond_to| DbCommand::Pending { kind, respond_to }).await
    }

    pub async fn delete(&self, kind: EntityKind, local_id: i64) -> Result<bool> {
        self.request(|respond_to| DbCommand::Delete { kind, local_id, respond_to }).await
    }

    pub async fn delete_many(&self, kind: EntityKind, local_ids: Vec<i64>) -> Result<usize> {
        self.request(|respond_to| DbCommand::DeleteMany { kind, local_ids, respond_to }).await
    }

    pub async fn claim(&self, kind: EntityKind, local_id: i64) -> Result<bool> {
        self.request(|respond_to| DbCommand::Claim { kind, local_id, respond_to }).await
    }

    pub async fn mark_failed(&self, kind: EntityKind, local_id: i64, error: String) -> Result<()> {
        self.request(|respond_to| DbCommand::MarkFailed { kind, local_id, error, respond_to }).await
    }

    pub async fn release(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        self.request(|respond_to| DbCommand::Release { kind, local_id, respond_to }).await
    }

    pub async fn reset_to_pending(&self, kind: EntityKind, local_id: Option<i64>) -> Result<usize> {
        self.request(|respond_to| DbCommand::ResetToPending { kind, local_id, respond_to }).await
    }

    pub async fn confirm(&self, kind: EntityKind, local_id: i64, server_id: i64) -> Result<usize> {
        self.request(|respond_to| DbCommand::Confirm { kind, local_id, server_id, respond_to }).await
    }

    pub async fn count(&self, kind: EntityKind) -> Result<usize> {
        self.request(|respond_to| DbCommand::Count { kind, respond_to }).await
    }

    pub async fn clear(&self, kind: EntityKind) -> Result<usize> {
        self.request(|respond_to| DbCommand::Clear { kind, respond_to }).await
    }

    /// 停止 DB Actor
    pub fn shutdown(&self) {
        let _ = self.sender.send(DbCommand::Shutdown);
    }
}
