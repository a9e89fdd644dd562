//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 初始化全局日志订阅器（RUST_LOG可覆盖级别）
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
