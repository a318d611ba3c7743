//! 工具通道管理
//!
//! 持有所有 Provider 的连接，按注册时声明的能力把逻辑工具名解析到唯一 Provider：
//! - 未注册的工具立即返回 Unavailable（不在本层重试，重试由 ReAct 循环负责）
//! - Provider 未就绪时在其 connect_timeout 内等待，不阻塞其他 Provider
//! - 同一 Provider 的调用按提交顺序串行（公平锁，先排队再等待就绪），不同 Provider 之间互不影响
//! - 显式降级映射：主 Provider 启动失败时改用 fallback Provider 的同名能力
//!
//! 实际调用在独立任务中执行并持有队列槽位；调用方放弃等待（取消）时，
//! 排队中的请求直接出队，已在执行的调用跑完后释放槽位，其结果被丢弃。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{timeout, timeout_at};

use crate::core::AgentError;
use crate::tools::{Capabilities, ToolCall, ToolErrorKind, ToolProvider, ToolResult, ToolSpec};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

/// Provider 健康状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProviderHealth {
    Connecting,
    Ready,
    Failed(String),
}

struct ProviderLane {
    name: String,
    provider: Arc<dyn ToolProvider>,
    connect_timeout: Duration,
    health: watch::Sender<ProviderHealth>,
    /// 调用队列：tokio Mutex 按 FIFO 唤醒等待者
    queue: Arc<Mutex<()>>,
    /// 排队中 + 执行中的调用数
    pending: Arc<AtomicUsize>,
}

impl ProviderLane {
    fn health(&self) -> ProviderHealth {
        self.health.borrow().clone()
    }

    async fn wait_ready(&self) -> Result<(), AgentError> {
        self.wait_ready_until(Instant::now() + self.connect_timeout).await
    }

    /// 等待就绪直到 deadline；已就绪时即使 deadline 已过也立即返回
    async fn wait_ready_until(&self, deadline: Instant) -> Result<(), AgentError> {
        let mut rx = self.health.subscribe();
        let waited = timeout_at(
            deadline.into(),
            rx.wait_for(|h| !matches!(h, ProviderHealth::Connecting)),
        )
        .await;
        let health = match waited {
            Err(_) => {
                return Err(AgentError::ProviderStartupTimeout {
                    provider: self.name.clone(),
                    secs: self.connect_timeout.as_secs(),
                })
            }
            Ok(Err(_)) => {
                return Err(AgentError::ToolUnavailable(format!(
                    "provider '{}' closed",
                    self.name
                )))
            }
            Ok(Ok(h)) => (*h).clone(),
        };
        match health {
            ProviderHealth::Ready => Ok(()),
            ProviderHealth::Failed(reason) => Err(AgentError::ToolUnavailable(format!(
                "provider '{}' failed to start: {}",
                self.name, reason
            ))),
            ProviderHealth::Connecting => Err(AgentError::ToolUnavailable(format!(
                "provider '{}' is still connecting",
                self.name
            ))),
        }
    }
}

/// 计入 pending，drop 时扣减
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct Route {
    lane: Arc<ProviderLane>,
    /// Provider 侧的工具名
    target: String,
}

#[derive(Clone, Default)]
struct RouteTable {
    primary: HashMap<String, (Route, ToolSpec)>,
    fallback: HashMap<String, Route>,
}

impl RouteTable {
    /// 主 Provider 启动失败且有可用 fallback 时走 fallback，否则走主路由
    fn resolve(&self, tool: &str) -> Option<Route> {
        let primary = self.primary.get(tool).map(|(r, _)| r);
        let fallback = self.fallback.get(tool);
        match (primary, fallback) {
            (Some(p), Some(f))
                if matches!(p.lane.health(), ProviderHealth::Failed(_))
                    && !matches!(f.lane.health(), ProviderHealth::Failed(_)) =>
            {
                Some(f.clone())
            }
            (Some(p), _) => Some(p.clone()),
            (None, Some(f)) => Some(f.clone()),
            (None, None) => None,
        }
    }
}

/// 会话级路由：基于会话开始时的路由表快照，每个工具名首次解析后固定，保证会话内路由稳定
pub struct SessionRouter {
    table: Arc<RouteTable>,
    pinned: HashMap<String, Option<Route>>,
    call_timeout: Duration,
}

impl SessionRouter {
    fn route(&mut self, tool: &str) -> Option<Route> {
        let table = &self.table;
        self.pinned
            .entry(tool.to_string())
            .or_insert_with(|| table.resolve(tool))
            .clone()
    }

    /// 该工具在本会话中被解析到的 Provider
    pub fn provider_for(&mut self, tool: &str) -> Option<String> {
        self.route(tool).map(|r| r.lane.name.clone())
    }

    /// 取消时是否可以放弃正在进行的调用；未解析到 Provider 时调用会立即返回，视为可放弃
    pub fn supports_abort(&mut self, tool: &str) -> bool {
        self.route(tool)
            .map(|r| r.lane.provider.supports_abort())
            .unwrap_or(true)
    }

    /// 执行一次调用：解析 Provider -> 排队 -> 等待就绪 -> 执行；每次调用输出 JSON 审计日志
    pub async fn call(&mut self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let result = match self.route(&call.tool) {
            Some(route) => dispatch(route, call, self.call_timeout, start).await,
            None => ToolResult::failure(
                &call.tool,
                None,
                ToolErrorKind::Unavailable,
                format!("No provider registered for tool '{}'", call.tool),
                start.elapsed(),
            ),
        };
        audit(call, &result);
        result
    }
}

async fn dispatch(route: Route, call: &ToolCall, call_timeout: Duration, start: Instant) -> ToolResult {
    let lane = route.lane;
    let provider_name = Some(lane.name.clone());
    let deadline = start + lane.connect_timeout;

    let pending = PendingGuard::new(lane.pending.clone());
    let permit = lane.queue.clone().lock_owned().await;

    if let Err(e) = lane.wait_ready_until(deadline).await {
        let kind = match e {
            AgentError::ProviderStartupTimeout { secs, .. } => ToolErrorKind::StartupTimeout { secs },
            _ => ToolErrorKind::Unavailable,
        };
        return ToolResult::failure(&call.tool, provider_name, kind, e.to_string(), start.elapsed());
    }

    let (tx, rx) = oneshot::channel();
    let provider = lane.provider.clone();
    let target = route.target.clone();
    let args = call.args_value();
    let name = lane.name.clone();
    tokio::spawn(async move {
        let _permit = permit;
        let _pending = pending;
        let outcome = timeout(call_timeout, provider.call(&target, args)).await;
        if tx.send(outcome).is_err() {
            tracing::debug!(provider = %name, tool = %target, "caller detached, late tool result discarded");
        }
    });

    match rx.await {
        Ok(Ok(Ok(payload))) => {
            ToolResult::success(&call.tool, provider_name, payload, start.elapsed())
        }
        Ok(Ok(Err(message))) => ToolResult::failure(
            &call.tool,
            provider_name,
            ToolErrorKind::Execution,
            message,
            start.elapsed(),
        ),
        Ok(Err(_)) => ToolResult::failure(
            &call.tool,
            provider_name,
            ToolErrorKind::Timeout,
            format!(
                "Tool '{}' timed out after {}s",
                call.tool,
                call_timeout.as_secs()
            ),
            start.elapsed(),
        ),
        Err(_) => ToolResult::failure(
            &call.tool,
            provider_name,
            ToolErrorKind::Execution,
            "provider task terminated unexpectedly",
            start.elapsed(),
        ),
    }
}

fn audit(call: &ToolCall, result: &ToolResult) {
    let outcome = match &result.outcome {
        crate::tools::ToolOutcome::Success { .. } => "ok".to_string(),
        crate::tools::ToolOutcome::Failure { kind, .. } => kind.label().to_string(),
    };
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": call.tool,
        "provider": result.provider,
        "ok": result.is_success(),
        "outcome": outcome,
        "duration_ms": result.latency.as_millis() as u64,
        "args_preview": args_preview(&call.args_value()),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

/// 工具通道管理器
pub struct ToolChannelManager {
    lanes: RwLock<HashMap<String, Arc<ProviderLane>>>,
    /// 写时复制：注册时替换整张表，已开始的会话继续使用旧快照
    routes: RwLock<Arc<RouteTable>>,
    call_timeout: Duration,
}

impl ToolChannelManager {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            routes: RwLock::new(Arc::new(RouteTable::default())),
            call_timeout,
        }
    }

    /// 注册 Provider 及其能力，并在后台开始连接；需在 tokio 运行时内调用。
    /// Provider 名或工具名重复时返回 Config 错误，保证解析结果唯一。
    pub fn register(
        &self,
        provider: Arc<dyn ToolProvider>,
        capabilities: Capabilities,
    ) -> Result<(), AgentError> {
        let name = provider.name().to_string();
        let mut lanes = self.lanes.write().unwrap_or_else(|e| e.into_inner());
        if lanes.contains_key(&name) {
            return Err(AgentError::Config(format!(
                "provider '{name}' already registered"
            )));
        }
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let mut table = (**routes).clone();
        for spec in &capabilities.tools {
            if let Some((existing, _)) = table.primary.get(&spec.name) {
                return Err(AgentError::Config(format!(
                    "tool '{}' already provided by '{}'",
                    spec.name, existing.lane.name
                )));
            }
        }

        let connect_timeout = capabilities
            .connect_timeout
            .unwrap_or_else(|| provider.class().default_connect_timeout());
        let (health, _) = watch::channel(ProviderHealth::Connecting);
        let lane = Arc::new(ProviderLane {
            name: name.clone(),
            provider,
            connect_timeout,
            health,
            queue: Arc::new(Mutex::new(())),
            pending: Arc::new(AtomicUsize::new(0)),
        });
        let tool_count = capabilities.tools.len();
        for spec in capabilities.tools {
            let route = Route {
                lane: lane.clone(),
                target: spec.name.clone(),
            };
            table.primary.insert(spec.name.clone(), (route, spec));
        }
        *routes = Arc::new(table);
        lanes.insert(name.clone(), lane.clone());
        drop(routes);
        drop(lanes);

        tracing::info!(
            provider = %name,
            tools = tool_count,
            connect_timeout_secs = connect_timeout.as_secs(),
            "provider registered"
        );
        tokio::spawn(async move {
            let started = Instant::now();
            match lane.provider.connect().await {
                Ok(()) => {
                    tracing::info!(
                        provider = %lane.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "provider ready"
                    );
                    lane.health.send_replace(ProviderHealth::Ready);
                }
                Err(e) => {
                    tracing::warn!(provider = %lane.name, error = %e, "provider failed to start");
                    lane.health.send_replace(ProviderHealth::Failed(e));
                }
            }
        });
        Ok(())
    }

    /// 显式降级映射：tool 的主 Provider 启动失败时，改用 provider 的 target 工具
    pub fn register_fallback(
        &self,
        tool: impl Into<String>,
        provider: &str,
        target: impl Into<String>,
    ) -> Result<(), AgentError> {
        let lanes = self.lanes.read().unwrap_or_else(|e| e.into_inner());
        let lane = lanes
            .get(provider)
            .cloned()
            .ok_or_else(|| AgentError::Config(format!("unknown fallback provider '{provider}'")))?;
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let mut table = (**routes).clone();
        table.fallback.insert(
            tool.into(),
            Route {
                lane,
                target: target.into(),
            },
        );
        *routes = Arc::new(table);
        Ok(())
    }

    /// 为新会话创建路由快照
    pub fn router(&self) -> SessionRouter {
        SessionRouter {
            table: self.routes.read().unwrap_or_else(|e| e.into_inner()).clone(),
            pinned: HashMap::new(),
            call_timeout: self.call_timeout,
        }
    }

    /// 单次调用（不属于任何会话）
    pub async fn call(&self, tool: &str, args: Value) -> ToolResult {
        self.router().call(&ToolCall::from_json(tool, args)).await
    }

    /// 该工具当前是否可以立即调用（已注册且 Provider 就绪）
    pub fn is_available(&self, tool: &str) -> bool {
        let table = self.routes.read().unwrap_or_else(|e| e.into_inner()).clone();
        table
            .resolve(tool)
            .map(|r| r.lane.health() == ProviderHealth::Ready)
            .unwrap_or(false)
    }

    pub fn health(&self, provider: &str) -> Option<ProviderHealth> {
        let lanes = self.lanes.read().unwrap_or_else(|e| e.into_inner());
        lanes.get(provider).map(|l| l.health())
    }

    /// 等待指定 Provider 就绪（启动阶段预热用）
    pub async fn wait_ready(&self, provider: &str) -> Result<(), AgentError> {
        let lane = {
            let lanes = self.lanes.read().unwrap_or_else(|e| e.into_inner());
            lanes.get(provider).cloned()
        };
        match lane {
            Some(lane) => lane.wait_ready().await,
            None => Err(AgentError::ToolUnavailable(format!(
                "unknown provider '{provider}'"
            ))),
        }
    }

    /// 排队中 + 执行中的调用数
    pub fn pending(&self, provider: &str) -> usize {
        let lanes = self.lanes.read().unwrap_or_else(|e| e.into_inner());
        lanes
            .get(provider)
            .map(|l| l.pending.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_idle(&self, provider: &str) -> bool {
        self.pending(provider) == 0
    }

    /// 所有可调用工具的描述，按名称排序
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let table = self.routes.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut specs: Vec<ToolSpec> = table.primary.values().map(|(_, s)| s.clone()).collect();
        for tool in table.fallback.keys() {
            if !table.primary.contains_key(tool) {
                specs.push(ToolSpec::new(tool.clone(), ""));
            }
        }
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

impl Default for ToolChannelManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
