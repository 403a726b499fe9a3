//! 数据库迁移与初始化 - 由 refinery 自动管理
//!
//! 统一入口 `init_db`：pragmas → migrate → 版本校验 → 中断恢复。
//! 新增迁移只需在 migrations/ 添加 V{n}__{name}.sql，编译期自动嵌入、自动执行。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, SyncSdkError};
use crate::storage::entities::{EntityKind, SyncStatus};
use crate::version::SDK_DB_VERSION;

/// refinery 使用的 migration 历史表名
const REFINERY_TABLE: &str = "refinery_schema_history";

/// 离线存储 PRAGMA：WAL、NORMAL 同步、内存临时表。
const STORE_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA temp_store=MEMORY;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(STORE_PRAGMAS.trim())
        .map_err(|e| SyncSdkError::Storage(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

/// 执行内置 migrations（编译期嵌入，自动按版本顺序执行）。
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| SyncSdkError::Storage(format!("执行 migration 失败: {}", e)))?;
    Ok(())
}

/// 读取 refinery 表中当前数据库的 migration 版本；无表或空表返回 None。
fn get_db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| SyncSdkError::Storage(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| SyncSdkError::Storage(format!("读取 migration 版本失败: {}", e)))?;

    Ok(version.filter(|&v| v > 0))
}

/// 若 DB 版本高于当前 SDK 支持的最高版本，拒绝打开。
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = get_db_migration_version(conn)? else { return Ok(()); };
    if v > SDK_DB_VERSION {
        return Err(SyncSdkError::Storage(format!(
            "数据库版本 {} 高于当前 SDK 支持的最高版本 {}，请升级 SDK 后再打开",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

/// 上次进程在同步途中退出时，Syncing 状态的记录要放回 Pending，否则永远不会再被处理。
pub fn recover_interrupted(conn: &Connection) -> Result<usize> {
    let mut recovered = 0;
    for kind in EntityKind::ALL {
        recovered += conn.execute(
            &format!(
                "UPDATE {} SET sync_status = ?1 WHERE sync_status = ?2",
                kind.store_name()
            ),
            [SyncStatus::Pending as i32, SyncStatus::Syncing as i32],
        )?;
    }
    if recovered > 0 {
        info!("恢复了 {} 条中断在 Syncing 状态的记录", recovered);
    }
    Ok(recovered)
}

/// 统一初始化入口：pragmas → migrations → 版本校验 → 中断恢复。
pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    run_migrations(conn)?;
    check_db_version(conn)?;
    recover_interrupted(conn)?;
    Ok(())
}
