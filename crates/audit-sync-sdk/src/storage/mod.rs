//! 存储模块 - 离线优先的本地持久化层
//!
//! - LocalStore: 每种实体一张表的记录存储，所有 SQL 在 DB Actor 线程里串行执行
//! - Entities: 数据实体定义
//! - SyncMetaStore: 基于 sled 的同步元数据

pub mod db_actor;
pub mod entities;
pub mod kv;
pub mod local_store;
pub mod migrate;

// 重新导出核心类型
pub use entities::{EntityKind, IndexQuery, ParentRef, Record, RecordPayload, SyncStatus};
pub use kv::SyncMetaStore;
pub use local_store::{LocalStore, RecordStream, StoreHandle};
