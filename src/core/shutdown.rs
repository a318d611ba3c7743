//! 进程关闭
//!
//! 根取消令牌是所有会话令牌的父令牌：Ctrl+C / SIGTERM 或致命错误触发后，
//! 运行中的会话在下一个检查点以 Cancelled 结束。命令循环退出后按注册顺序执行收尾步骤，
//! 通常先等待活跃会话写完记忆，再把记忆刷盘。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::memory::MemoryStore;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 记忆无法写入等基础设施错误
    FatalError(String),
}

/// 持有根取消令牌；只记录第一次关闭的原因
pub struct ShutdownManager {
    root: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// 根令牌；InterruptionController 从它派生每个会话的令牌
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                return;
            }
            tracing::info!(reason = ?reason, "shutdown requested");
            *current = Some(reason);
        }
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ctrl+C 与 SIGTERM（unix）触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时的一个收尾步骤
#[async_trait::async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<()>;
}

/// 按注册顺序执行收尾步骤；单步失败或超时只记录日志，不影响后续步骤
pub struct ShutdownCoordinator {
    hooks: Vec<Box<dyn ShutdownHook>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            hooks: Vec::new(),
            step_timeout,
        }
    }

    pub fn register(&mut self, hook: impl ShutdownHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// 返回成功完成的步骤数
    pub async fn run(&self) -> usize {
        let mut completed = 0;
        for hook in &self.hooks {
            match tokio::time::timeout(self.step_timeout, hook.run()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::info!(hook = hook.name(), "shutdown step done");
                }
                Ok(Err(e)) => tracing::warn!(hook = hook.name(), error = %e, "shutdown step failed"),
                Err(_) => tracing::warn!(
                    hook = hook.name(),
                    timeout_ms = self.step_timeout.as_millis() as u64,
                    "shutdown step timed out"
                ),
            }
        }
        completed
    }
}

/// 记忆刷盘；compact 时再把超出配置窗口的历史从文件中移除
pub struct MemoryFlush {
    store: Arc<MemoryStore>,
    compact: bool,
}

impl MemoryFlush {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            compact: true,
        }
    }

    pub fn with_compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }
}

#[async_trait::async_trait]
impl ShutdownHook for MemoryFlush {
    fn name(&self) -> &'static str {
        "memory_flush"
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.store.flush().await?;
        if self.compact {
            let removed = self.store.compact(chrono::Utc::now()).await?;
            tracing::debug!(removed, "memory file compacted on shutdown");
        }
        Ok(())
    }
}

/// 运行命令循环直到其结束或收到关闭信号。
/// 收到信号后最多再等 drain，让正在执行的会话走到终态，然后执行收尾步骤。
pub async fn run_with_graceful_shutdown<F>(
    manager: &Arc<ShutdownManager>,
    drain: Duration,
    app: F,
    coordinator: ShutdownCoordinator,
) where
    F: Future<Output = ()>,
{
    manager.install_signal_handlers();
    let root = manager.token();
    tokio::pin!(app);

    tokio::select! {
        _ = &mut app => tracing::info!("command loop finished"),
        _ = root.cancelled() => {
            if tokio::time::timeout(drain, &mut app).await.is_err() {
                tracing::warn!(
                    drain_ms = drain.as_millis() as u64,
                    "command loop did not stop within drain period"
                );
            }
        }
    }

    coordinator.run().await;
}
