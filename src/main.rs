//! dealer - 命令行前端
//!
//! 入口：初始化日志、加载配置、启动工具供应进程与对话图，逐行读取用户输入并打印回复。
//! 退出（quit / 输入结束 / Ctrl+C / SIGTERM）时停止所有供应进程。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use dealer::agent::{create_agent_components, process_message, AgentComponents};
use dealer::config::load_config;
use dealer::core::{
    run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    SupervisorCleanup,
};
use dealer::graph::TurnState;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dealer::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let cleanup_timeout = cfg.supervisor.shutdown_grace_secs + 2;

    let components = create_agent_components(cfg)
        .await
        .context("Failed to create agent")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone()).with_timeout(cleanup_timeout);
    if let Some(manager) = &components.supervisor {
        coordinator.register(SupervisorCleanup::new(manager.clone()));
    }

    run_with_graceful_shutdown(
        shutdown.clone(),
        repl(&components, shutdown),
        || coordinator.run_cleanup(),
    )
    .await;

    Ok(())
}

async fn repl(components: &AgentComponents, shutdown: Arc<ShutdownManager>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state: Option<TurnState> = None;

    println!("dealer ready. Commands: /status, /reset, quit");
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read stdin");
                break;
            }
        };
        let input = line.trim();
        match input {
            "" => continue,
            "quit" | "exit" => {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                break;
            }
            "/reset" => {
                state = None;
                println!("(conversation reset)");
                continue;
            }
            "/status" => {
                print_status(components).await;
                continue;
            }
            _ => {}
        }

        let outcome = process_message(components, state.take(), input).await;
        tracing::debug!(trace = ?outcome.trace, "turn trace");
        println!("{}", outcome.reply);
        state = Some(outcome.state);
    }
}

async fn print_status(components: &AgentComponents) {
    let Some(manager) = &components.supervisor else {
        println!("tool backend: local");
        return;
    };
    for entry in &components.config.servers {
        match manager.status(&entry.name).await {
            Some(status) => println!("{}: {:?}", entry.name, status),
            None => println!("{}: not running", entry.name),
        }
    }
    let (prompt, completion, total) = components.graph.token_usage();
    println!("tokens: prompt={} completion={} total={}", prompt, completion, total);
}
