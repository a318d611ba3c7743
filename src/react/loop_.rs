//! ReAct 主循环（ReasoningLoop）
//!
//! 每轮：取消检查 -> 步数预算检查 -> 组装上下文并请求 Oracle ->
//! FinalAnswer 则 Completed；Action 则经 SessionRouter 调用工具、追加 Step、再次检查取消。
//!
//! - Oracle 输出不可解析/调用失败：记为一步（OracleError + 修正提示），累计达 max_parse_retries 时 Failed(OracleParseError)
//! - 工具失败：作为 Observation 交回 Oracle 自我修正，累计达 max_tool_retries 时 Failed(ToolExecutionError)
//! - 每轮都追加一步，重试占用步数预算，因此 steps.len() <= max_steps 恒成立
//!
//! 阻塞与非阻塞模式共用本循环，差别只在 AbortPolicy：
//! Cooperative 只在检查点观察取消；Forced 在取消后给进行中的调用一个宽限期，超时即放弃等待。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::{
    AgentError, FailureKind, Observation, RecoveryAction, RecoveryEngine, Session, SessionId,
    SessionStatus, TaskResult,
};
use crate::memory::MemoryEntry;
use crate::react::{Decision, OracleContext, ReasoningOracle, SessionEvent};
use crate::tools::ToolChannelManager;

/// Observation 日志预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 非阻塞模式默认强制中止宽限期
pub const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(3);

/// 会话级预算
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_steps: usize,
    pub max_parse_retries: usize,
    pub max_tool_retries: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_parse_retries: 2,
            max_tool_retries: 2,
        }
    }
}

/// 取消时如何对待进行中的 Oracle / 工具调用
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortPolicy {
    /// 等调用自然结束，在下一个检查点退出
    Cooperative,
    /// 取消后最多再等 grace；工具 Provider 不支持中止时退化为 Cooperative
    Forced { grace: Duration },
}

/// 单次运行参数
#[derive(Clone)]
pub struct RunOptions {
    pub cancel: CancellationToken,
    pub abort: AbortPolicy,
    pub event_tx: Option<broadcast::Sender<SessionEvent>>,
}

impl RunOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            abort: AbortPolicy::Cooperative,
            event_tx: None,
        }
    }

    pub fn with_abort(mut self, abort: AbortPolicy) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_events(mut self, tx: broadcast::Sender<SessionEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn send(&self, ev: SessionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }
}

pub struct ReasoningLoop {
    oracle: Arc<dyn ReasoningOracle>,
    tools: Arc<ToolChannelManager>,
    recovery: RecoveryEngine,
    limits: LoopLimits,
}

impl ReasoningLoop {
    pub fn new(oracle: Arc<dyn ReasoningOracle>, tools: Arc<ToolChannelManager>) -> Self {
        Self {
            oracle,
            tools,
            recovery: RecoveryEngine::new(),
            limits: LoopLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> LoopLimits {
        self.limits
    }

    pub fn tools(&self) -> &Arc<ToolChannelManager> {
        &self.tools
    }

    /// 运行一个会话直到终态；会话级失败以 TaskResult.status 返回，不会作为错误抛出
    pub async fn run(
        &self,
        id: SessionId,
        command: &str,
        prior_memory: &[MemoryEntry],
        opts: RunOptions,
    ) -> TaskResult {
        let mut session = Session::new(id, command);
        let mut router = self.tools.router();
        let tool_specs = self.tools.tool_specs();
        let max_steps = self.limits.max_steps;
        let mut parse_failures = 0usize;
        let mut tool_failures = 0usize;
        let mut final_text = String::new();

        tracing::info!(session = %id, command, memory = prior_memory.len(), "session started");
        opts.send(SessionEvent::Started {
            session_id: id,
            command: command.to_string(),
        });

        let status = loop {
            if opts.cancel.is_cancelled() {
                break SessionStatus::Cancelled;
            }
            if session.steps().len() >= max_steps {
                break SessionStatus::Exhausted;
            }

            let step = session.steps().len();
            opts.send(SessionEvent::Thinking { step, max_steps });
            let decision = {
                let ctx = OracleContext::new(command, session.steps(), prior_memory, &tool_specs);
                match opts.abort {
                    AbortPolicy::Cooperative => Some(self.oracle.decide(&ctx).await),
                    AbortPolicy::Forced { grace } => {
                        race_cancel(self.oracle.decide(&ctx), &opts.cancel, grace).await
                    }
                }
            };
            let Some(decision) = decision else {
                tracing::info!(session = %id, step, "oracle call abandoned after grace period");
                break SessionStatus::Cancelled;
            };
            // 宽限期内返回的决策不再执行
            if opts.cancel.is_cancelled() {
                tracing::info!(session = %id, step, "decision dropped, session cancelled during oracle call");
                break SessionStatus::Cancelled;
            }

            match decision {
                Err(err) => {
                    parse_failures += 1;
                    let action = self.recovery.handle(&err);
                    tracing::warn!(
                        session = %id,
                        step,
                        attempt = parse_failures,
                        error = %err,
                        "oracle decision rejected"
                    );
                    opts.send(recovery_event(&action, &err));
                    let appended = session.push_step(
                        "",
                        None,
                        Observation::OracleError {
                            message: err.to_string(),
                            hint: action.hint().to_string(),
                        },
                    );
                    opts.send(SessionEvent::StepAppended {
                        step: appended.clone(),
                    });
                    if parse_failures >= self.limits.max_parse_retries
                        || action == RecoveryAction::Abort
                    {
                        final_text = format!("无法理解模型输出：{err}");
                        break SessionStatus::Failed(FailureKind::OracleParseError);
                    }
                }
                Ok(Decision::FinalAnswer { thought, text }) => {
                    let appended = session.push_step(
                        thought,
                        None,
                        Observation::FinalAnswer { text: text.clone() },
                    );
                    opts.send(SessionEvent::StepAppended {
                        step: appended.clone(),
                    });
                    final_text = text;
                    break SessionStatus::Completed;
                }
                Ok(Decision::Action { thought, call }) => {
                    tracing::info!(session = %id, step, tool = %call.tool, "dispatching tool");
                    opts.send(SessionEvent::ToolCall {
                        tool: call.tool.clone(),
                        args: call.args_value(),
                    });
                    let result = match opts.abort {
                        AbortPolicy::Forced { grace } if router.supports_abort(&call.tool) => {
                            race_cancel(router.call(&call), &opts.cancel, grace).await
                        }
                        _ => Some(router.call(&call).await),
                    };
                    let Some(result) = result else {
                        tracing::info!(
                            session = %id,
                            step,
                            tool = %call.tool,
                            "tool call detached after grace period, late result will be discarded"
                        );
                        break SessionStatus::Cancelled;
                    };

                    let observation = result.observation_text();
                    tracing::debug!(
                        session = %id,
                        step,
                        ok = result.is_success(),
                        observation = %preview(&observation),
                        "tool observation"
                    );
                    let failure = result
                        .to_error()
                        .map(|err| (self.recovery.handle(&err), err));
                    let hint = failure
                        .as_ref()
                        .map(|(action, _)| action.hint().to_string())
                        .unwrap_or_default();
                    let appended =
                        session.push_step(thought, Some(call), Observation::Tool { result, hint });
                    opts.send(SessionEvent::StepAppended {
                        step: appended.clone(),
                    });

                    if let Some((action, err)) = failure {
                        tool_failures += 1;
                        tracing::warn!(
                            session = %id,
                            step,
                            attempt = tool_failures,
                            error = %err,
                            "tool failed"
                        );
                        opts.send(recovery_event(&action, &err));
                        if tool_failures >= self.limits.max_tool_retries {
                            final_text = format!("工具执行失败：{observation}");
                            break SessionStatus::Failed(FailureKind::ToolExecutionError);
                        }
                    }

                    if opts.cancel.is_cancelled() {
                        break SessionStatus::Cancelled;
                    }
                }
            }
        };

        match status {
            SessionStatus::Cancelled => {
                tracing::info!(session = %id, reason = %AgentError::CancelledByInterruption, "session stopped");
                final_text = "任务已取消".to_string();
            }
            SessionStatus::Exhausted => {
                tracing::warn!(session = %id, reason = %AgentError::StepBudgetExceeded(max_steps), "session stopped");
                final_text = format!("已达到最大步数 {max_steps}，任务未完成");
            }
            _ => {}
        }
        session.finish(status);
        let result = session.into_result(final_text, parse_failures, tool_failures);

        tracing::info!(
            session = %id,
            status = result.status.label(),
            steps = result.steps.len(),
            parse_retries = result.parse_retries,
            tool_retries = result.tool_retries,
            "session finished"
        );
        opts.send(terminal_event(&result, max_steps));
        result
    }
}

/// 与取消信号赛跑：取消后最多再等 grace，超时返回 None（future 被丢弃）
async fn race_cancel<F: Future>(
    fut: F,
    cancel: &CancellationToken,
    grace: Duration,
) -> Option<F::Output> {
    tokio::pin!(fut);
    tokio::select! {
        biased;
        out = &mut fut => Some(out),
        _ = cancel.cancelled() => tokio::time::timeout(grace, &mut fut).await.ok(),
    }
}

fn recovery_event(action: &RecoveryAction, err: &AgentError) -> SessionEvent {
    let name = match action {
        RecoveryAction::RetryWithPrompt(_) => "retry_with_prompt",
        RecoveryAction::SelfCorrect(_) => "self_correct",
        RecoveryAction::Abort => "abort",
    };
    SessionEvent::Recovery {
        action: name.to_string(),
        detail: err.to_string(),
    }
}

fn terminal_event(result: &TaskResult, max_steps: usize) -> SessionEvent {
    match result.status {
        SessionStatus::Completed => SessionEvent::Completed {
            text: result.final_text.clone(),
        },
        SessionStatus::Failed(reason) => SessionEvent::Failed {
            reason,
            text: result.final_text.clone(),
        },
        SessionStatus::Exhausted => SessionEvent::Exhausted { max_steps },
        SessionStatus::Cancelled | SessionStatus::Running => SessionEvent::Cancelled,
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!(
            "{}...",
            text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>()
        )
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Capabilities, ProviderClass, ToolCall, ToolProvider};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本依次返回决策；脚本耗尽后返回 Final Answer
    struct ScriptedOracle {
        script: Mutex<VecDeque<Result<Decision, AgentError>>>,
    }

    impl ScriptedOracle {
        fn new(script: Vec<Result<Decision, AgentError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl ReasoningOracle for ScriptedOracle {
        async fn decide(&self, _ctx: &OracleContext<'_>) -> Result<Decision, AgentError> {
            self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(Decision::FinalAnswer {
                    thought: String::new(),
                    text: "done".into(),
                })
            })
        }
    }

    struct Desktop;

    #[async_trait]
    impl ToolProvider for Desktop {
        fn name(&self) -> &str {
            "desktop"
        }

        fn class(&self) -> ProviderClass {
            ProviderClass::Desktop
        }

        async fn call(&self, tool: &str, _args: Value) -> Result<String, String> {
            match tool {
                "broken" => Err("element not found".into()),
                _ => Ok(format!("{tool} ok")),
            }
        }
    }

    fn action(tool: &str) -> Result<Decision, AgentError> {
        Ok(Decision::Action {
            thought: format!("call {tool}"),
            call: ToolCall::from_json(tool, serde_json::json!({})),
        })
    }

    fn tools() -> Arc<ToolChannelManager> {
        let manager = ToolChannelManager::default();
        manager
            .register(Arc::new(Desktop), Capabilities::from_names(&["click", "broken"]))
            .unwrap();
        Arc::new(manager)
    }

    async fn run(oracle: Arc<ScriptedOracle>, limits: LoopLimits) -> TaskResult {
        let lp = ReasoningLoop::new(oracle, tools()).with_limits(limits);
        lp.run(SessionId::new(), "cmd", &[], RunOptions::new(CancellationToken::new()))
            .await
    }

    #[tokio::test]
    async fn test_step_budget_exhausted() {
        let script = (0..20).map(|_| action("click")).collect();
        let result = run(ScriptedOracle::new(script), LoopLimits::default()).await;
        assert_eq!(result.status, SessionStatus::Exhausted);
        assert_eq!(result.steps.len(), 10);
    }

    #[tokio::test]
    async fn test_parse_retries_consume_step_budget() {
        let limits = LoopLimits {
            max_steps: 3,
            max_parse_retries: 5,
            max_tool_retries: 5,
        };
        let script = (0..5)
            .map(|_| Err(AgentError::OracleParse("garbage".into())))
            .collect();
        let result = run(ScriptedOracle::new(script), limits).await;
        assert_eq!(result.status, SessionStatus::Exhausted);
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.parse_retries, 3);
    }

    #[tokio::test]
    async fn test_tool_retry_cap_is_per_session() {
        let script = vec![action("broken"), action("click"), action("broken")];
        let result = run(ScriptedOracle::new(script), LoopLimits::default()).await;
        assert_eq!(result.status, SessionStatus::Failed(FailureKind::ToolExecutionError));
        assert_eq!(result.tool_retries, 2);
        assert_eq!(result.steps.len(), 3);
        assert!(result.final_text.contains("element not found"));
    }

    #[tokio::test]
    async fn test_transport_error_counts_as_parse_failure() {
        let script = vec![
            Err(AgentError::OracleTransport("timeout".into())),
            action("click"),
        ];
        let result = run(ScriptedOracle::new(script), LoopLimits::default()).await;
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.parse_retries, 1);
        assert!(matches!(
            result.steps[0].observation,
            Observation::OracleError { .. }
        ));
        assert_eq!(result.steps.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_oracle_call() {
        let token = CancellationToken::new();
        token.cancel();
        let lp = ReasoningLoop::new(ScriptedOracle::new(vec![action("click")]), tools());
        let result = lp.run(SessionId::new(), "cmd", &[], RunOptions::new(token)).await;
        assert_eq!(result.status, SessionStatus::Cancelled);
        assert!(result.steps.is_empty());
    }

    #[tokio::test]
    async fn test_events_end_with_single_terminal() {
        let (tx, mut rx) = broadcast::channel(64);
        let lp = ReasoningLoop::new(ScriptedOracle::new(vec![action("click")]), tools());
        let result = lp
            .run(
                SessionId::new(),
                "cmd",
                &[],
                RunOptions::new(CancellationToken::new()).with_events(tx),
            )
            .await;
        assert_eq!(result.status, SessionStatus::Completed);

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(events.first(), Some(SessionEvent::Started { .. })));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(matches!(events.last(), Some(SessionEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_race_cancel_detaches_after_grace() {
        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.cancel();
        });
        let started = std::time::Instant::now();
        let out = race_cancel(
            tokio::time::sleep(Duration::from_secs(5)),
            &token,
            Duration::from_millis(30),
        )
        .await;
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));

        let out = race_cancel(async { 7 }, &token, Duration::from_millis(30)).await;
        assert_eq!(out, Some(7));
    }

    /// 慢速 Oracle：等待后决定调用工具
    struct SlowOracle {
        delay: Duration,
    }

    #[async_trait]
    impl ReasoningOracle for SlowOracle {
        async fn decide(&self, _ctx: &OracleContext<'_>) -> Result<Decision, AgentError> {
            tokio::time::sleep(self.delay).await;
            action("launch_app")
        }
    }

    struct CountingDesktop {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolProvider for CountingDesktop {
        fn name(&self) -> &str {
            "desktop"
        }

        fn class(&self) -> ProviderClass {
            ProviderClass::Desktop
        }

        async fn call(&self, tool: &str, _args: Value) -> Result<String, String> {
            self.calls.lock().unwrap().push(tool.to_string());
            Ok("已启动".into())
        }
    }

    #[tokio::test]
    async fn test_decision_returned_within_grace_is_not_dispatched() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let manager = ToolChannelManager::default();
        manager
            .register(
                Arc::new(CountingDesktop {
                    calls: calls.clone(),
                }),
                Capabilities::from_names(&["launch_app"]),
            )
            .unwrap();
        let oracle = Arc::new(SlowOracle {
            delay: Duration::from_millis(100),
        });
        let lp = ReasoningLoop::new(oracle, Arc::new(manager));

        let token = CancellationToken::new();
        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            t.cancel();
        });
        let opts = RunOptions::new(token).with_abort(AbortPolicy::Forced {
            grace: Duration::from_millis(500),
        });
        let result = lp.run(SessionId::new(), "打开记事本", &[], opts).await;

        assert_eq!(result.status, SessionStatus::Cancelled);
        assert!(result.steps.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_failure_hint_is_stored_on_step() {
        let script = vec![action("broken"), action("click")];
        let result = run(ScriptedOracle::new(script), LoopLimits::default()).await;
        assert_eq!(result.status, SessionStatus::Completed);
        match &result.steps[0].observation {
            Observation::Tool { result, hint } => {
                assert!(!result.is_success());
                assert!(hint.contains("请检查参数"));
            }
            other => panic!("Expected tool observation, got {:?}", other),
        }
        match &result.steps[1].observation {
            Observation::Tool { hint, .. } => assert!(hint.is_empty()),
            other => panic!("Expected tool observation, got {:?}", other),
        }
    }
}
