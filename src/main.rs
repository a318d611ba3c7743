//! 小智 - 语音命令执行助手
//!
//! 入口：初始化日志、加载配置、装配运行时；从标准输入逐行读取已识别的命令（每行一条）。
//! 阻塞模式逐条执行；非阻塞模式下新命令会中断上一条仍在运行的会话（等同新的唤醒事件）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use xiaozhi::agent::create_runtime;
use xiaozhi::config::{load_config, AppConfig};
use xiaozhi::core::{
    MemoryFlush, Observation, ShutdownCoordinator, ShutdownManager, ShutdownReason, TaskResult,
};
use xiaozhi::core::shutdown::run_with_graceful_shutdown;
use xiaozhi::observability;
use xiaozhi::react::SessionEvent;
use xiaozhi::runtime::{ExecutionMode, ExecutionModeAdapter, SessionDrain};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    let runtime = create_runtime(&cfg, shutdown.token())
        .await
        .context("Failed to create runtime")?;

    // 先等活跃会话写完记忆，再刷盘
    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    coordinator.register(SessionDrain::new(runtime.adapter.clone()));
    coordinator.register(
        MemoryFlush::new(runtime.memory.clone()).with_compact(cfg.memory.compact_on_shutdown),
    );

    let adapter = runtime.adapter.clone();
    let manager = shutdown.clone();
    let drain = cfg.execution.abort_grace() + cfg.tools.tool_timeout();
    run_with_graceful_shutdown(
        &shutdown,
        drain,
        async move {
            if let Err(e) = command_loop(adapter, manager.clone()).await {
                tracing::error!("Command loop failed: {:#}", e);
                manager.shutdown(ShutdownReason::FatalError(e.to_string()));
            }
        },
        coordinator,
    )
    .await;

    let (prompt, completion, total) = runtime.oracle.token_usage();
    tracing::info!(prompt, completion, total, "LLM token usage");
    Ok(())
}

async fn command_loop(
    adapter: Arc<ExecutionModeAdapter>,
    shutdown: Arc<ShutdownManager>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<tokio::task::JoinHandle<()>> = None;
    let token = shutdown.token();
    println!("请输入命令（每行一条，Ctrl+D 退出）：");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = token.cancelled() => break,
        };
        let Some(line) = line else { break };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        match adapter.mode() {
            ExecutionMode::Blocking => {
                let result = adapter
                    .run_blocking(command)
                    .await
                    .context("Session could not be recorded")?;
                print_result(&result);
            }
            ExecutionMode::NonBlocking => {
                let mut handle = adapter.run_async(command);
                let shutdown = shutdown.clone();
                current = Some(tokio::spawn(async move {
                    while let Some(ev) = handle.next_event().await {
                        print_event(&ev);
                    }
                    match handle.join().await {
                        Ok(result) => print_result(&result),
                        Err(e) => {
                            tracing::error!("Session could not be recorded: {}", e);
                            shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
                        }
                    }
                }));
            }
        }
    }

    if let Some(task) = current {
        let _ = task.await;
    }
    Ok(())
}

fn print_event(ev: &SessionEvent) {
    match ev {
        SessionEvent::ToolCall { tool, args } => println!("  -> {} {}", tool, args),
        SessionEvent::StepAppended { step } => {
            if let Observation::Tool { result, .. } = &step.observation {
                println!("  <- [{}] {}", step.index, result.observation_text());
            }
        }
        SessionEvent::Recovery { action, detail } => println!("  !! {}: {}", action, detail),
        _ => {}
    }
}

fn print_result(result: &TaskResult) {
    println!(
        "[{}] {} (steps: {}, tool retries: {}, parse retries: {})",
        result.status.label(),
        result.final_text,
        result.steps.len(),
        result.tool_retries,
        result.parse_retries
    );
}
