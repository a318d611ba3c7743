//! 执行模式适配
//!
//! - 阻塞模式 run_blocking：在调用方任务上直接驱动循环，取消只在检查点生效
//! - 非阻塞模式 run_async：spawn 独立任务，返回 SessionHandle（取消 + 事件流 + join）；
//!   取消后对进行中的调用给 abort_grace 宽限期，超时即以 Cancelled 结束
//!
//! 同一时刻只允许一个活跃会话：开始新会话会先对旧会话发出中断信号。
//! 会话结束时写入一条记忆（写入失败为致命错误，向调用方返回 Err），再交付给 AnswerSink。
//! 活跃标记与中断令牌由 ActiveSession 守卫在会话结束时释放，任务 panic 或被丢弃时同样释放。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AgentError, InterruptionController, SessionId, SessionStatus, ShutdownHook, TaskResult,
};
use crate::memory::{MemoryEntry, MemoryStore};
use crate::react::{AbortPolicy, ReasoningLoop, RunOptions, SessionEvent, DEFAULT_ABORT_GRACE};
use crate::runtime::AnswerSink;

/// 单个会话事件通道容量
const EVENT_CAPACITY: usize = 256;

/// 启动时选择的执行模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Blocking,
    NonBlocking,
}

pub struct ExecutionModeAdapter {
    reasoning: Arc<ReasoningLoop>,
    memory: Arc<MemoryStore>,
    interrupts: Arc<InterruptionController>,
    sink: Option<Arc<dyn AnswerSink>>,
    mode: ExecutionMode,
    abort_grace: Duration,
    active: watch::Sender<Option<SessionId>>,
}

impl ExecutionModeAdapter {
    pub fn new(
        reasoning: Arc<ReasoningLoop>,
        memory: Arc<MemoryStore>,
        interrupts: Arc<InterruptionController>,
    ) -> Self {
        Self {
            reasoning,
            memory,
            interrupts,
            sink: None,
            mode: ExecutionMode::default(),
            abort_grace: DEFAULT_ABORT_GRACE,
            active: watch::channel(None).0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AnswerSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace = grace;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn active_session(&self) -> Option<SessionId> {
        *self.active.borrow()
    }

    /// 等待当前没有活跃会话（活跃会话已写完记忆并交付结果）
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|active| active.is_none()).await;
    }

    /// 外部中断触发（如新的唤醒事件）：取消当前活跃会话
    pub fn interrupt_active(&self) -> Option<SessionId> {
        let id = self.active_session()?;
        self.interrupts.signal(id);
        Some(id)
    }

    /// 阻塞模式：直到会话进入终态才返回
    pub async fn run_blocking(&self, command: &str) -> Result<TaskResult, AgentError> {
        let (id, token) = self.begin();
        let _active = ActiveSession { adapter: self, id };
        let memory = self.memory.recent(Utc::now());
        let result = self
            .reasoning
            .run(id, command, &memory, RunOptions::new(token))
            .await;
        self.finish(&result).await?;
        Ok(result)
    }

    /// 非阻塞模式：立即返回句柄，会话在独立任务中运行
    pub fn run_async(self: &Arc<Self>, command: impl Into<String>) -> SessionHandle {
        let (id, token) = self.begin();
        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        let opts = RunOptions::new(token.clone())
            .with_abort(AbortPolicy::Forced {
                grace: self.abort_grace,
            })
            .with_events(tx);
        let adapter = Arc::clone(self);
        let command = command.into();
        let join = tokio::spawn(async move {
            let _active = ActiveSession {
                adapter: adapter.as_ref(),
                id,
            };
            let memory = adapter.memory.recent(Utc::now());
            let result = adapter.reasoning.run(id, &command, &memory, opts).await;
            adapter.finish(&result).await?;
            Ok(result)
        });
        SessionHandle {
            id,
            cancel: token,
            events: rx,
            join,
        }
    }

    fn begin(&self) -> (SessionId, CancellationToken) {
        let id = SessionId::new();
        let token = self.interrupts.begin(id);
        if let Some(previous) = self.active.send_replace(Some(id)) {
            tracing::info!(previous = %previous, next = %id, "new session supersedes active one");
            self.interrupts.signal(previous);
        }
        (id, token)
    }

    /// 注销令牌；仍是活跃会话时清除活跃标记
    fn release(&self, id: SessionId) {
        self.interrupts.end(id);
        self.active.send_if_modified(|active| {
            if *active == Some(id) {
                *active = None;
                true
            } else {
                false
            }
        });
    }

    async fn finish(&self, result: &TaskResult) -> Result<(), AgentError> {
        let id = result.session_id;
        self.memory
            .append(MemoryEntry::new(&result.command, result.outcome_summary()))
            .await
            .map_err(|e| {
                tracing::error!(session = %id, error = %e, "failed to persist session memory");
                e
            })?;
        if result.status != SessionStatus::Cancelled {
            if let Some(sink) = &self.sink {
                sink.deliver(result).await;
            }
        }
        Ok(())
    }
}

/// 会话运行期间持有；drop 时释放活跃标记与中断令牌
struct ActiveSession<'a> {
    adapter: &'a ExecutionModeAdapter,
    id: SessionId,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.adapter.release(self.id);
    }
}

/// 关闭收尾：中断活跃会话并等待它写完记忆
pub struct SessionDrain {
    adapter: Arc<ExecutionModeAdapter>,
}

impl SessionDrain {
    pub fn new(adapter: Arc<ExecutionModeAdapter>) -> Self {
        Self { adapter }
    }
}

#[async_trait::async_trait]
impl ShutdownHook for SessionDrain {
    fn name(&self) -> &'static str {
        "session_drain"
    }

    async fn run(&self) -> anyhow::Result<()> {
        if let Some(id) = self.adapter.interrupt_active() {
            tracing::info!(session = %id, "waiting for active session to stop");
        }
        self.adapter.wait_idle().await;
        Ok(())
    }
}

/// 后台会话句柄
pub struct SessionHandle {
    id: SessionId,
    cancel: CancellationToken,
    events: broadcast::Receiver<SessionEvent>,
    join: JoinHandle<Result<TaskResult, AgentError>>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 请求取消；幂等
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 新订阅者，只能收到订阅之后的事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.resubscribe()
    }

    /// 下一个事件；会话任务结束且事件取完后返回 None
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        next(&mut self.events).await
    }

    /// 取走从会话开始起的完整事件流（句柄本身改为从当前位置继续接收）
    pub fn events(&mut self) -> Pin<Box<dyn Stream<Item = SessionEvent> + Send>> {
        let fresh = self.events.resubscribe();
        let rx = std::mem::replace(&mut self.events, fresh);
        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            next(&mut rx).await.map(|ev| (ev, rx))
        }))
    }

    /// 等待会话结束；只有记忆写入失败或任务 panic 时返回 Err
    pub async fn join(self) -> Result<TaskResult, AgentError> {
        self.join
            .await
            .map_err(|e| AgentError::TaskJoin(e.to_string()))?
    }
}

async fn next(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<SessionEvent> {
    loop {
        match rx.recv().await {
            Ok(ev) => return Some(ev),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session event receiver lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
