//! KV 存储模块 - 基于 sled 的同步元数据
//!
//! 记录最近一轮同步的汇总和每种实体最近一次拉取的时间，供 UI 展示。
//! 值统一用 JSON 序列化。

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{Result, SyncSdkError};
use crate::storage::entities::EntityKind;
use crate::sync::coordinator::SyncSummary;

const META_TREE: &str = "sync_meta";
const LAST_SUMMARY_KEY: &str = "last_summary";
const LAST_PULL_PREFIX: &str = "last_pull:";

/// 同步元数据存储
#[derive(Debug, Clone)]
pub struct SyncMetaStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SyncMetaStore {
    /// 打开（或创建）元数据库
    pub async fn open(kv_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(kv_path)
            .await
            .map_err(|e| SyncSdkError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个进程刚退出时文件锁可能还没释放，带退避重试几次
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 200;
        let mut attempt = 0;
        let db = loop {
            match sled::open(kv_path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(SyncSdkError::KvStore(format!("打开 sled 数据库失败: {}", e)));
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        };

        Self::from_db(db)
    }

    /// 临时库（进程退出即删除），测试和内存模式用
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| SyncSdkError::KvStore(format!("打开临时 sled 数据库失败: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = db
            .open_tree(META_TREE)
            .map_err(|e| SyncSdkError::KvStore(format!("打开 Tree 失败: {}", e)))?;
        Ok(Self { db, tree })
    }

    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SyncSdkError::Serialization(format!("序列化值失败: {}", e)))?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }

    pub fn get<V: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<V>> {
        match self.tree.get(key)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| SyncSdkError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn save_summary(&self, summary: &SyncSummary) -> Result<()> {
        self.set(LAST_SUMMARY_KEY, summary)?;
        debug!("保存同步汇总 pass_id={}", summary.pass_id);
        Ok(())
    }

    pub fn last_summary(&self) -> Result<Option<SyncSummary>> {
        self.get(LAST_SUMMARY_KEY)
    }

    pub fn set_last_pull(&self, kind: EntityKind, timestamp: i64) -> Result<()> {
        self.set(&format!("{}{}", LAST_PULL_PREFIX, kind.as_str()), &timestamp)
    }

    pub fn last_pull_at(&self, kind: EntityKind) -> Result<Option<i64>> {
        self.get(&format!("{}{}", LAST_PULL_PREFIX, kind.as_str()))
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
