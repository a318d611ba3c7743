//! 运行时装配
//!
//! 按配置创建 LLM / Oracle、工具通道（本地 Provider + 降级映射）、记忆存储、中断控制与执行模式适配器。
//! 所有组件显式传入，不使用全局单例；记忆在启动时加载，关闭时由 ShutdownCoordinator 刷盘。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ToolsSection};
use crate::core::{AgentError, InterruptionController};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::MemoryStore;
use crate::react::{LlmOracle, ReasoningLoop, DEFAULT_SYSTEM_PROMPT};
use crate::runtime::{ExecutionModeAdapter, TracingSink};
use crate::tools::{
    EchoTool, LaunchAppTool, LocalProvider, ProviderClass, ToolChannelManager, ToolRegistry,
};

/// 本地桌面 Provider 名称
pub const LOCAL_PROVIDER: &str = "desktop";

/// 装配完成的运行时
pub struct AgentRuntime {
    pub adapter: Arc<ExecutionModeAdapter>,
    pub tools: Arc<ToolChannelManager>,
    pub memory: Arc<MemoryStore>,
    pub interrupts: Arc<InterruptionController>,
    pub oracle: Arc<LlmOracle>,
}

/// 按 provider 与 API Key 选择 LLM：mock 或无 Key 时回退到 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("DASHSCOPE_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .ok();
    match api_key {
        Some(key) if provider != "mock" => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                &key,
                Duration::from_secs(cfg.llm.timeout_secs),
            ))
        }
        _ => {
            tracing::warn!("No API key set or provider is mock, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 读取 system prompt 文件；未配置或读取失败时使用内置提示词
pub fn load_system_prompt(cfg: &AppConfig) -> String {
    let Some(path) = &cfg.agent.system_prompt_path else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => s,
        Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read system prompt, using built-in");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

/// 各类 Provider 的连接超时（配置覆盖默认值）
pub fn connect_timeout_for(class: ProviderClass, tools: &ToolsSection) -> Duration {
    if class.is_heavy() {
        Duration::from_secs(tools.heavy_connect_timeout_secs)
    } else {
        Duration::from_secs(tools.light_connect_timeout_secs)
    }
}

/// 注册本地 Provider 与配置中的降级映射；需在 tokio 运行时内调用
pub fn create_tool_channels(cfg: &AppConfig) -> Result<Arc<ToolChannelManager>, AgentError> {
    let manager = ToolChannelManager::new(cfg.tools.tool_timeout());

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(LaunchAppTool::new(cfg.tools.launch.allowed_apps.clone()));
    let local = LocalProvider::new(LOCAL_PROVIDER, ProviderClass::Desktop, registry);
    let capabilities = local
        .capabilities()
        .with_connect_timeout(connect_timeout_for(ProviderClass::Desktop, &cfg.tools));
    manager.register(Arc::new(local), capabilities)?;

    for fallback in &cfg.tools.fallbacks {
        manager.register_fallback(&fallback.tool, &fallback.provider, &fallback.target)?;
    }
    Ok(Arc::new(manager))
}

/// 创建完整运行时；shutdown 令牌取消时所有活跃会话随之取消
pub async fn create_runtime(
    cfg: &AppConfig,
    shutdown: CancellationToken,
) -> Result<AgentRuntime, AgentError> {
    let memory = Arc::new(MemoryStore::open(&cfg.memory.path, cfg.memory.window()).await?);

    let tools = create_tool_channels(cfg)?;
    let oracle = Arc::new(LlmOracle::new(
        create_llm_from_config(cfg),
        load_system_prompt(cfg),
    ));
    let reasoning = Arc::new(
        ReasoningLoop::new(oracle.clone(), tools.clone()).with_limits(cfg.agent.limits()),
    );
    let interrupts = Arc::new(InterruptionController::with_parent(shutdown));
    let adapter = Arc::new(
        ExecutionModeAdapter::new(reasoning, memory.clone(), interrupts.clone())
            .with_sink(Arc::new(TracingSink))
            .with_mode(cfg.execution.mode)
            .with_abort_grace(cfg.execution.abort_grace()),
    );

    tracing::info!(
        mode = ?cfg.execution.mode,
        tools = tools.tool_specs().len(),
        memory_entries = memory.len(),
        "runtime ready"
    );
    Ok(AgentRuntime {
        adapter,
        tools,
        memory,
        interrupts,
        oracle,
    })
}
