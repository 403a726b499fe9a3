//! 编译期元信息：
//! - vergen 生成 VERGEN_GIT_SHA、VERGEN_BUILD_TIMESTAMP
//! - SDK_DB_VERSION：migrations/ 下 V{n}__*.sql 的最大 n

use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

/// refinery 文件名格式 V{version}__{name}.sql
fn migration_version(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_prefix('V')?.strip_suffix(".sql")?;
    let (version, _) = stem.split_once("__")?;
    version.parse().ok()
}

fn main() {
    let _ = EmitBuilder::builder().build_timestamp().git_sha(true).emit();

    let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    let db_version = fs::read_dir(&migrations_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|entry| entry.file_name().to_str().and_then(migration_version))
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    println!("cargo:rustc-env=SDK_DB_VERSION={}", db_version);
    println!("cargo:rerun-if-changed=migrations/");
}
