//! Deskpilot 命令行入口
//!
//! `deskpilot <instruction>` 执行一条指令并以 JSON 打印 RunReport；
//! `deskpilot --status` 打印 Agent 状态；`deskpilot --prune` 按保留策略清理经验库。
//! Ctrl+C 在下一个步骤开始前取消当前运行。

use std::sync::Arc;

use anyhow::Context;
use deskpilot::config::load_config_or_default;
use deskpilot::core::{ShutdownManager, ShutdownReason};
use deskpilot::Agent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deskpilot::observability::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = load_config_or_default(None);
    let agent = Agent::from_config(&cfg).context("Failed to create agent")?;

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let coordinator = agent.shutdown_coordinator(Arc::clone(&manager));

    let output = match args.first().map(String::as_str) {
        None => {
            eprintln!("usage: deskpilot <instruction> | --status | --prune");
            None
        }
        Some("--status") => Some(serde_json::to_string_pretty(&agent.status())?),
        Some("--prune") => {
            let report = agent.prune().context("Prune failed")?;
            Some(serde_json::to_string_pretty(&report)?)
        }
        Some(_) => {
            let instruction = args.join(" ");
            let report = agent
                .submit_with_cancel(instruction.as_str(), manager.token().child_token())
                .await;
            Some(serde_json::to_string_pretty(&report).context("Failed to encode report")?)
        }
    };
    if let Some(output) = output {
        println!("{output}");
    }

    if !manager.is_shutdown() {
        manager.shutdown(ShutdownReason::Completed);
    }
    coordinator.run_cleanup().await;
    Ok(())
}
