//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，可通过 RUST_LOG 覆盖；每个步骤的审计事件（step_audit）由执行控制器输出。

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::from_default_env().add_directive(
        "info"
            .parse()
            .unwrap_or_else(|_| LevelFilter::INFO.into()),
    );
    // 测试或嵌入场景下可能已安装过订阅器，重复安装时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
