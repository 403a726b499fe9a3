//! SDK 版本与构建信息
//!
//! SDK 版本来自 Cargo.toml；数据库版本由 build.rs 扫描 migrations/ 得到，
//! 打开本地库时用它拒绝比当前 SDK 更新的库。

/// SDK semver
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（短 SHA），拿不到时为 "unknown"
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 当前 SDK 支持的最高数据库 migration 版本
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

/// 编译期解析 build.rs 输出的版本号
const fn parse_db_version(s: &str) -> i64 {
    let bytes = s.as_bytes();
    let mut value = 0i64;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            value = value * 10 + (bytes[i] - b'0') as i64;
        }
        i += 1;
    }
    value
}

/// 一行版本描述，初始化日志里使用
pub fn version_string() -> String {
    format!("{} ({}, db v{}, built {})", SDK_VERSION, GIT_SHA, SDK_DB_VERSION, BUILD_TIME)
}
