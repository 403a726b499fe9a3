//! 数据实体定义 - 对应本地记录表结构
//!
//! 每种实体一张表（articles / audits / audit_points / pending_evaluations / pending_documents），
//! 行结构统一为 [`Record`]，业务字段放在 [`RecordPayload`] 里按类型区分。

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::remote::RemoteRecord;

/// 实体类型（同时决定本地表名）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Article,
    Audit,
    AuditPoint,
    Evaluation,
    Document,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Article,
        EntityKind::Audit,
        EntityKind::AuditPoint,
        EntityKind::Evaluation,
        EntityKind::Document,
    ];

    /// 推送顺序：父级稽核在前，子记录在后
    pub const PUSH_ORDER: [EntityKind; 4] = [
        EntityKind::Audit,
        EntityKind::Article,
        EntityKind::Evaluation,
        EntityKind::Document,
    ];

    /// 可以从服务端整表拉取的类型
    pub const PULLABLE: [EntityKind; 3] = [
        EntityKind::Article,
        EntityKind::Audit,
        EntityKind::AuditPoint,
    ];

    /// 本地表名
    pub fn store_name(&self) -> &'static str {
        match self {
            EntityKind::Article => "articles",
            EntityKind::Audit => "audits",
            EntityKind::AuditPoint => "audit_points",
            EntityKind::Evaluation => "pending_evaluations",
            EntityKind::Document => "pending_documents",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Article => "article",
            EntityKind::Audit => "audit",
            EntityKind::AuditPoint => "audit_point",
            EntityKind::Evaluation => "evaluation",
            EntityKind::Document => "document",
        }
    }

    pub fn from_store_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.store_name() == name)
    }

    /// 稽核点只作为离线缓存，从不推送
    pub fn is_pushable(&self) -> bool {
        !matches!(self, EntityKind::AuditPoint)
    }

    pub fn is_pullable(&self) -> bool {
        Self::PULLABLE.contains(self)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 记录同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum SyncStatus {
    Pending = 0,
    Syncing = 1,
    Synced = 2,
    Failed = 3,
}

impl SyncStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(SyncStatus::Pending),
            1 => Some(SyncStatus::Syncing),
            2 => Some(SyncStatus::Synced),
            3 => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Failed 等同于带失败记录的 Pending，下一轮同步照常处理
    pub fn is_eligible_for_sync(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

/// 子记录对父级稽核的引用
///
/// 离线新建的稽核还没有服务端 ID，子记录先挂在本地主键上，父级确认后改挂服务端 ID。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "ref", content = "id", rename_all = "snake_case")]
pub enum ParentRef {
    Local(i64),
    Server(i64),
}

impl ParentRef {
    pub fn server_id(&self) -> Option<i64> {
        match self {
            ParentRef::Server(id) => Some(*id),
            ParentRef::Local(_) => None,
        }
    }
}

/// 业务字段（按实体类型区分）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Article {
        title: String,
        content: String,
    },
    Audit {
        title: String,
        #[serde(default)]
        site: Option<String>,
        #[serde(default)]
        auditor: Option<String>,
        #[serde(default)]
        category_id: Option<i64>,
        #[serde(default)]
        scheduled_for: Option<String>,
    },
    AuditPoint {
        audit: ParentRef,
        label: String,
        #[serde(default)]
        position: i32,
    },
    Evaluation {
        audit: ParentRef,
        point_id: i64,
        answer: String,
        #[serde(default)]
        score: Option<f64>,
        #[serde(default)]
        comment: Option<String>,
    },
    Document {
        audit: ParentRef,
        #[serde(default)]
        point_id: Option<i64>,
        filename: String,
        mime_type: String,
        /// 文件内容 SHA-256（十六进制）
        checksum: String,
        /// 文件内容单独存放在 blob 列
        #[serde(skip)]
        bytes: Bytes,
    },
}

impl RecordPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            RecordPayload::Article { .. } => EntityKind::Article,
            RecordPayload::Audit { .. } => EntityKind::Audit,
            RecordPayload::AuditPoint { .. } => EntityKind::AuditPoint,
            RecordPayload::Evaluation { .. } => EntityKind::Evaluation,
            RecordPayload::Document { .. } => EntityKind::Document,
        }
    }

    /// 构造文档载荷并计算校验和
    pub fn document(
        audit: ParentRef,
        point_id: Option<i64>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Bytes,
    ) -> Self {
        use sha2::{Digest, Sha256};
        let checksum = hex::encode(Sha256::digest(&bytes));
        RecordPayload::Document {
            audit,
            point_id,
            filename: filename.into(),
            mime_type: mime_type.into(),
            checksum,
            bytes,
        }
    }

    /// 与服务端记录做匹配时使用的键
    pub fn match_key(&self) -> String {
        match self {
            RecordPayload::Article { title, .. } | RecordPayload::Audit { title, .. } => title.clone(),
            RecordPayload::AuditPoint { label, .. } => label.clone(),
            RecordPayload::Evaluation { point_id, .. } => point_id.to_string(),
            RecordPayload::Document { filename, .. } => filename.clone(),
        }
    }

    pub fn parent(&self) -> Option<ParentRef> {
        match self {
            RecordPayload::AuditPoint { audit, .. }
            | RecordPayload::Evaluation { audit, .. }
            | RecordPayload::Document { audit, .. } => Some(*audit),
            _ => None,
        }
    }

    pub fn set_parent(&mut self, parent: ParentRef) {
        match self {
            RecordPayload::AuditPoint { audit, .. }
            | RecordPayload::Evaluation { audit, .. }
            | RecordPayload::Document { audit, .. } => *audit = parent,
            _ => {}
        }
    }

    pub fn blob(&self) -> Option<&Bytes> {
        match self {
            RecordPayload::Document { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    pub fn attach_blob(&mut self, blob: Bytes) {
        if let RecordPayload::Document { bytes, .. } = self {
            *bytes = blob;
        }
    }

    /// 从服务端列表项还原本地载荷（拉取时用）
    pub fn from_remote(kind: EntityKind, remote: &RemoteRecord) -> Option<Self> {
        let raw = &remote.raw;
        let text = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .find_map(|k| raw.get(*k).and_then(|v| v.as_str()).map(str::to_string))
        };
        let int = |keys: &[&str]| -> Option<i64> {
            keys.iter().find_map(|k| {
                raw.get(*k).and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            })
        };
        let title = remote.title.clone().unwrap_or_default();

        match kind {
            EntityKind::Article => Some(RecordPayload::Article {
                title,
                content: text(&["content", "body"]).unwrap_or_default(),
            }),
            EntityKind::Audit => Some(RecordPayload::Audit {
                title,
                site: text(&["site", "location"]),
                auditor: text(&["auditor", "auditeur"]),
                category_id: int(&["category_id", "categorie_id"]),
                scheduled_for: text(&["scheduled_for", "date_audit", "date"]),
            }),
            EntityKind::AuditPoint => Some(RecordPayload::AuditPoint {
                audit: ParentRef::Server(int(&["audit_id", "auditId"])?),
                label: title,
                position: int(&["position", "ordre", "order"]).unwrap_or(0) as i32,
            }),
            // 评估和文档只推不拉
            EntityKind::Evaluation | EntityKind::Document => None,
        }
    }
}

/// 本地记录 - 对应每张实体表的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// 本地主键（SQLite 自增，0 表示尚未保存）
    pub local_id: i64,
    /// 服务端 ID（None 表示尚未在服务端确认创建）
    pub server_id: Option<i64>,
    pub payload: RecordPayload,
    /// 创建/最后修改时间（UTC 毫秒）
    pub timestamp: i64,
    pub sync_status: SyncStatus,
    /// 失败次数
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Record {
    /// UI 新建的待同步记录
    pub fn new_pending(payload: RecordPayload) -> Self {
        Self {
            local_id: 0,
            server_id: None,
            payload,
            timestamp: crate::utils::time::now_millis(),
            sync_status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// 服务端已存在的记录（拉取时插入）
    pub fn new_synced(server_id: i64, payload: RecordPayload, timestamp: i64) -> Self {
        Self {
            local_id: 0,
            server_id: Some(server_id),
            payload,
            timestamp,
            sync_status: SyncStatus::Synced,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.payload.kind()
    }

    /// 是否可以被推送（没有服务端 ID 且处于 Pending/Failed）
    pub fn needs_push(&self) -> bool {
        self.server_id.is_none() && self.sync_status.is_eligible_for_sync()
    }
}

/// 二级索引查询
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexQuery {
    /// 按父级稽核查（稽核点、评估、文档）
    ParentAudit(ParentRef),
    /// 按服务端 ID 查（去重用）
    ServerId(i64),
    /// 按同步状态查
    SyncStatus(SyncStatus),
}
