//! 编排集成测试：ReAct 循环 + 工具通道 + 执行模式 + 记忆

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;

    use xiaozhi::core::{
        AgentError, FailureKind, InterruptionController, Observation, SessionId, SessionStatus,
    };
    use xiaozhi::llm::LlmClient;
    use xiaozhi::memory::{MemoryStore, Message};
    use xiaozhi::react::{
        Decision, LlmOracle, LoopLimits, OracleContext, ReasoningLoop, ReasoningOracle,
        RunOptions, SessionEvent,
    };
    use xiaozhi::runtime::ExecutionModeAdapter;
    use xiaozhi::tools::{Capabilities, ProviderClass, ToolCall, ToolChannelManager, ToolProvider};

    /// 按脚本返回决策，脚本耗尽后给出 Final Answer；记录每轮看到的记忆条数
    struct ScriptedOracle {
        script: Mutex<VecDeque<Result<Decision, AgentError>>>,
        repeat: Option<Decision>,
        seen_memory: Mutex<Vec<usize>>,
    }

    impl ScriptedOracle {
        fn new(script: Vec<Result<Decision, AgentError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                repeat: None,
                seen_memory: Mutex::new(Vec::new()),
            })
        }

        /// 永远返回同一个决策
        fn repeating(decision: Decision) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                repeat: Some(decision),
                seen_memory: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ReasoningOracle for ScriptedOracle {
        async fn decide(&self, ctx: &OracleContext<'_>) -> Result<Decision, AgentError> {
            self.seen_memory.lock().unwrap().push(ctx.memory.len());
            if let Some(next) = self.script.lock().unwrap().pop_front() {
                return next;
            }
            Ok(self.repeat.clone().unwrap_or(Decision::FinalAnswer {
                thought: "任务已完成".into(),
                text: "done".into(),
            }))
        }
    }

    /// 可编排的 Provider：记录调用顺序，可设置延迟、首次失败、第 N 次调用时触发取消
    struct RecordingProvider {
        name: String,
        class: ProviderClass,
        delay: Mutex<VecDeque<Duration>>,
        log: Arc<Mutex<Vec<String>>>,
        calls: AtomicUsize,
        cancel_on_call: Option<(usize, CancellationToken)>,
    }

    impl RecordingProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                class: ProviderClass::Desktop,
                delay: Mutex::new(VecDeque::new()),
                log: Arc::new(Mutex::new(Vec::new())),
                calls: AtomicUsize::new(0),
                cancel_on_call: None,
            }
        }

        fn with_delays(self, delays: &[u64]) -> Self {
            *self.delay.lock().unwrap() = delays.iter().map(|ms| Duration::from_millis(*ms)).collect();
            self
        }
    }

    #[async_trait]
    impl ToolProvider for RecordingProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn class(&self) -> ProviderClass {
            self.class
        }

        async fn call(&self, tool: &str, args: Value) -> Result<String, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let tag = args.get("tag").and_then(|v| v.as_str()).unwrap_or(tool).to_string();
            let delay = self.delay.lock().unwrap().pop_front().unwrap_or_default();
            self.log.lock().unwrap().push(format!("start:{tag}"));
            tokio::time::sleep(delay).await;
            self.log.lock().unwrap().push(format!("end:{tag}"));
            if let Some((k, token)) = &self.cancel_on_call {
                if n == *k {
                    token.cancel();
                }
            }
            if tool == "broken" {
                return Err("element not found".into());
            }
            Ok(format!("{tool} ok"))
        }
    }

    fn act(tool: &str, args: Value) -> Result<Decision, AgentError> {
        Ok(Decision::Action {
            thought: format!("调用 {tool}"),
            call: ToolCall::from_json(tool, args),
        })
    }

    fn manager_with(provider: RecordingProvider, tools: &[&str], call_timeout: Duration) -> Arc<ToolChannelManager> {
        let manager = ToolChannelManager::new(call_timeout);
        manager
            .register(Arc::new(provider), Capabilities::from_names(tools))
            .unwrap();
        Arc::new(manager)
    }

    fn opts() -> RunOptions {
        RunOptions::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_three_step_session_completes() {
        let provider = RecordingProvider::new("desktop");
        let log = provider.log.clone();
        let tools = manager_with(provider, &["launch_app", "click"], Duration::from_secs(5));
        let oracle = ScriptedOracle::new(vec![
            act("launch_app", json!({"app_name": "app A"})),
            act("click", json!({"x": 100, "y": 200})),
            Ok(Decision::FinalAnswer {
                thought: "任务已完成".into(),
                text: "done".into(),
            }),
        ]);
        let reasoning = ReasoningLoop::new(oracle, tools);
        let result = reasoning.run(SessionId::new(), "打开 app A 并点击", &[], opts()).await;

        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.final_text, "done");
        assert_eq!(result.steps.len(), 3);
        let indices: Vec<usize> = result.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(result.steps[0].action.as_ref().unwrap().tool, "launch_app");
        assert_eq!(result.steps[1].action.as_ref().unwrap().args["x"], 100);
        assert!(result.steps[2].action.is_none());
        assert_eq!(result.tool_retries, 0);
        assert_eq!(log.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_tool_timeout_then_retry_succeeds() {
        // 第一次调用超过调用超时，第二次立即返回
        let provider = RecordingProvider::new("desktop").with_delays(&[300, 0]);
        let tools = manager_with(provider, &["screenshot"], Duration::from_millis(50));
        let oracle = ScriptedOracle::new(vec![
            act("screenshot", json!({})),
            act("screenshot", json!({})),
        ]);
        let reasoning = ReasoningLoop::new(oracle, tools);
        let result = reasoning.run(SessionId::new(), "截个图", &[], opts()).await;

        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.tool_retries, 1);
        assert_eq!(result.steps.len(), 3);
        assert!(result.steps[0].is_tool_failure());
        assert!(!result.steps[1].is_tool_failure());
    }

    struct GarbageLlm;

    #[async_trait]
    impl LlmClient for GarbageLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            Ok("嗯……让我想想".to_string())
        }
    }

    #[tokio::test]
    async fn test_two_unparseable_outputs_fail_without_tool_calls() {
        let provider = RecordingProvider::new("desktop");
        let log = provider.log.clone();
        let tools = manager_with(provider, &["click"], Duration::from_secs(5));
        let oracle = Arc::new(LlmOracle::new(Arc::new(GarbageLlm), "sys"));
        let reasoning = ReasoningLoop::new(oracle, tools);
        let result = reasoning.run(SessionId::new(), "点一下", &[], opts()).await;

        assert_eq!(result.status, SessionStatus::Failed(FailureKind::OracleParseError));
        assert_eq!(result.parse_retries, 2);
        assert_eq!(result.tool_calls(), 0);
        assert!(log.lock().unwrap().is_empty());
        assert!(result
            .steps
            .iter()
            .all(|s| matches!(s.observation, Observation::OracleError { .. })));
    }

    #[tokio::test]
    async fn test_step_budget_holds_under_retries() {
        let tools = manager_with(RecordingProvider::new("desktop"), &["broken"], Duration::from_secs(5));
        let oracle = ScriptedOracle::repeating(Decision::Action {
            thought: String::new(),
            call: ToolCall::from_json("broken", json!({})),
        });
        let limits = LoopLimits {
            max_steps: 10,
            max_parse_retries: 2,
            max_tool_retries: 100,
        };
        let reasoning = ReasoningLoop::new(oracle, tools).with_limits(limits);
        let result = reasoning.run(SessionId::new(), "cmd", &[], opts()).await;

        assert_eq!(result.status, SessionStatus::Exhausted);
        assert_eq!(result.steps.len(), 10);
        assert_eq!(result.tool_retries, 10);
    }

    #[tokio::test]
    async fn test_cancel_at_any_step_releases_provider() {
        for k in [0usize, 1, 4, 10] {
            let token = CancellationToken::new();
            let mut provider = RecordingProvider::new("desktop");
            if k == 0 {
                token.cancel();
            } else {
                provider.cancel_on_call = Some((k, token.clone()));
            }
            let tools = manager_with(provider, &["click"], Duration::from_secs(5));
            let oracle = ScriptedOracle::repeating(Decision::Action {
                thought: String::new(),
                call: ToolCall::from_json("click", json!({})),
            });
            let reasoning = ReasoningLoop::new(oracle, tools.clone());
            let result = reasoning
                .run(SessionId::new(), "cmd", &[], RunOptions::new(token))
                .await;

            assert_eq!(result.status, SessionStatus::Cancelled, "k = {k}");
            assert_eq!(result.steps.len(), k, "k = {k}");
            assert!(tools.is_idle("desktop"), "k = {k}");
        }
    }

    fn adapter_for(
        tools: Arc<ToolChannelManager>,
        oracle: Arc<ScriptedOracle>,
        grace: Duration,
    ) -> Arc<ExecutionModeAdapter> {
        Arc::new(
            ExecutionModeAdapter::new(
                Arc::new(ReasoningLoop::new(oracle, tools)),
                Arc::new(MemoryStore::in_memory(chrono::Duration::seconds(300))),
                Arc::new(InterruptionController::new()),
            )
            .with_abort_grace(grace),
        )
    }

    #[tokio::test]
    async fn test_non_blocking_cancel_detaches_at_grace_deadline() {
        let provider = RecordingProvider::new("desktop").with_delays(&[0, 1500]);
        let tools = manager_with(provider, &["click", "navigate"], Duration::from_secs(10));
        let oracle = ScriptedOracle::new(vec![
            act("click", json!({})),
            act("navigate", json!({"url": "https://example.com"})),
        ]);
        let grace = Duration::from_millis(200);
        let adapter = adapter_for(tools.clone(), oracle, grace);

        let mut handle = adapter.run_async("打开网页");
        let mut cancelled_at = None;
        while let Some(ev) = handle.next_event().await {
            if let SessionEvent::ToolCall { tool, .. } = &ev {
                if tool == "navigate" {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    handle.cancel();
                    cancelled_at = Some(Instant::now());
                }
            }
        }
        let cancelled_at = cancelled_at.unwrap();
        let result = handle.join().await.unwrap();
        let waited = cancelled_at.elapsed();

        assert_eq!(result.status, SessionStatus::Cancelled);
        assert_eq!(result.steps.len(), 1);
        assert!(waited >= grace, "{waited:?}");
        assert!(waited < Duration::from_millis(1000), "{waited:?}");

        // 被放弃的调用仍占用 Provider 直到返回，结果被丢弃后释放
        assert_eq!(tools.pending("desktop"), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(tools.is_idle("desktop"));
    }

    #[tokio::test]
    async fn test_queued_call_released_on_cancel() {
        let provider = RecordingProvider::new("desktop").with_delays(&[800]);
        let tools = manager_with(provider, &["click"], Duration::from_secs(10));

        let busy = {
            let tools = tools.clone();
            tokio::spawn(async move { tools.call("click", json!({"tag": "busy"})).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let oracle = ScriptedOracle::new(vec![act("click", json!({"tag": "queued"}))]);
        let reasoning = ReasoningLoop::new(oracle, tools.clone());
        let token = CancellationToken::new();
        let run = {
            let token = token.clone();
            tokio::spawn(async move {
                reasoning
                    .run(
                        SessionId::new(),
                        "cmd",
                        &[],
                        RunOptions::new(token).with_abort(xiaozhi::react::AbortPolicy::Forced {
                            grace: Duration::from_millis(50),
                        }),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tools.pending("desktop"), 2);

        token.cancel();
        let result = run.await.unwrap();
        assert_eq!(result.status, SessionStatus::Cancelled);
        assert_eq!(tools.pending("desktop"), 1);
        assert!(busy.await.unwrap().is_success());
        assert!(tools.is_idle("desktop"));
    }

    #[tokio::test]
    async fn test_same_provider_calls_follow_submission_order() {
        let provider = RecordingProvider::new("desktop").with_delays(&[60, 60]);
        let log = provider.log.clone();
        let tools = manager_with(provider, &["type"], Duration::from_secs(5));

        let first = {
            let reasoning = ReasoningLoop::new(
                ScriptedOracle::new(vec![act("type", json!({"tag": "A"}))]),
                tools.clone(),
            );
            tokio::spawn(async move { reasoning.run(SessionId::new(), "A", &[], opts()).await })
        };
        tokio::time::sleep(Duration::from_millis(15)).await;
        let second = {
            let reasoning = ReasoningLoop::new(
                ScriptedOracle::new(vec![act("type", json!({"tag": "B"}))]),
                tools.clone(),
            );
            tokio::spawn(async move { reasoning.run(SessionId::new(), "B", &[], opts()).await })
        };
        assert_eq!(first.await.unwrap().status, SessionStatus::Completed);
        assert_eq!(second.await.unwrap().status, SessionStatus::Completed);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:A", "end:A", "start:B", "end:B"]
        );
    }

    #[tokio::test]
    async fn test_different_providers_progress_independently() {
        let manager = ToolChannelManager::new(Duration::from_secs(5));
        manager
            .register(
                Arc::new(RecordingProvider::new("desktop").with_delays(&[500])),
                Capabilities::from_names(&["click"]),
            )
            .unwrap();
        let mut browser = RecordingProvider::new("browser");
        browser.class = ProviderClass::Browser;
        manager
            .register(Arc::new(browser), Capabilities::from_names(&["navigate"]))
            .unwrap();
        let tools = Arc::new(manager);

        let slow = {
            let reasoning = ReasoningLoop::new(
                ScriptedOracle::new(vec![act("click", json!({}))]),
                tools.clone(),
            );
            tokio::spawn(async move { reasoning.run(SessionId::new(), "slow", &[], opts()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let reasoning = ReasoningLoop::new(
            ScriptedOracle::new(vec![act("navigate", json!({}))]),
            tools.clone(),
        );
        let fast = reasoning.run(SessionId::new(), "fast", &[], opts()).await;
        assert_eq!(fast.status, SessionStatus::Completed);
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!slow.is_finished());
        assert_eq!(slow.await.unwrap().status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_memory_survives_restart_and_feeds_next_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.jsonl");
        let window = chrono::Duration::seconds(300);
        let tools = manager_with(RecordingProvider::new("desktop"), &["click"], Duration::from_secs(5));

        {
            let store = Arc::new(MemoryStore::open(&path, window).await.unwrap());
            let adapter = ExecutionModeAdapter::new(
                Arc::new(ReasoningLoop::new(ScriptedOracle::new(vec![]), tools.clone())),
                store,
                Arc::new(InterruptionController::new()),
            );
            adapter.run_blocking("打开记事本").await.unwrap();
        }

        let store = Arc::new(MemoryStore::open(&path, window).await.unwrap());
        assert_eq!(store.len(), 1);
        let oracle = ScriptedOracle::new(vec![]);
        let adapter = ExecutionModeAdapter::new(
            Arc::new(ReasoningLoop::new(oracle.clone(), tools)),
            store.clone(),
            Arc::new(InterruptionController::new()),
        );
        adapter.run_blocking("再打开计算器").await.unwrap();

        assert_eq!(*oracle.seen_memory.lock().unwrap(), vec![1]);
        let recent = store.recent(chrono::Utc::now());
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].command, "打开记事本");
        assert_eq!(recent[1].command, "再打开计算器");
    }
}
