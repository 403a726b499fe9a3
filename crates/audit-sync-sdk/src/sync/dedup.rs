//! 拉取后的去重
//!
//! 以服务端列表为准，对一张本地表做一次 O(本地 + 远端) 的整理：
//! - 同一 server_id 只保留 local_id 最小的一条
//! - server_id 不在服务端列表里的记录视为孤儿，删除
//! - 服务端有而本地没有的记录以 Synced 状态插入
//! - 没有 server_id 的待同步记录不动

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::error::Result;
use crate::remote::RemoteRecord;
use crate::storage::entities::{EntityKind, Record, RecordPayload};
use crate::storage::local_store::LocalStore;
use crate::utils::time::now_millis;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupReport {
    pub duplicates_removed: usize,
    pub orphans_removed: usize,
    pub inserted: usize,
}

impl DedupReport {
    pub fn is_noop(&self) -> bool {
        self.duplicates_removed == 0 && self.orphans_removed == 0 && self.inserted == 0
    }
}

#[derive(Debug, Clone)]
pub struct DeduplicationPass {
    store: LocalStore,
}

impl DeduplicationPass {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn run(&self, kind: EntityKind, remote: &[RemoteRecord]) -> Result<DedupReport> {
        let locals = self.store.get_all_vec(kind).await?;
        let remote_ids: HashSet<i64> = remote.iter().map(|r| r.id).collect();

        // get_all 按 local_id 升序，先出现的就是要保留的那条
        let mut kept: HashMap<i64, i64> = HashMap::with_capacity(locals.len());
        let mut duplicates = Vec::new();
        let mut orphans = Vec::new();

        for local in &locals {
            let Some(server_id) = local.server_id else { continue };
            if kept.contains_key(&server_id) {
                duplicates.push(local.local_id);
            } else if !remote_ids.contains(&server_id) {
                orphans.push(local.local_id);
                kept.insert(server_id, local.local_id);
            } else {
                kept.insert(server_id, local.local_id);
            }
        }

        let mut to_insert = Vec::new();
        let mut queued: HashSet<i64> = HashSet::new();
        for record in remote {
            if kept.contains_key(&record.id) || !queued.insert(record.id) {
                continue;
            }
            match RecordPayload::from_remote(kind, record) {
                Some(payload) => to_insert.push(Record::new_synced(
                    record.id,
                    payload,
                    record.created_at.unwrap_or_else(now_millis),
                )),
                None => warn!("{} server_id={} 缺少必要字段，跳过", kind, record.id),
            }
        }

        let report = DedupReport {
            duplicates_removed: self.store.delete_many(kind, duplicates).await?,
            orphans_removed: self.store.delete_many(kind, orphans).await?,
            inserted: self.store.put_many(kind, to_insert).await?.len(),
        };

        if !report.is_noop() {
            info!(
                "{} 去重完成: 删除重复 {} 条，删除孤儿 {} 条，新增 {} 条",
                kind, report.duplicates_removed, report.orphans_removed, report.inserted
            );
        }
        Ok(report)
    }
}
