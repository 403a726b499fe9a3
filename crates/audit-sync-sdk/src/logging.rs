//! 日志初始化
//!
//! 宿主应用没有自己的 subscriber 时可以调用 [`init_tracing`]。
//! 支持 `RUST_LOG` 覆盖默认级别，重复调用无副作用。

use tracing_subscriber::EnvFilter;

fn default_directive(debug_mode: bool) -> &'static str {
    if debug_mode {
        "audit_sync_sdk=debug"
    } else {
        "audit_sync_sdk=info"
    }
}

/// 初始化全局 tracing subscriber
pub fn init_tracing(debug_mode: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_mode)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(debug_mode)
        .try_init();
}
