//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `XIAOZHI__*` 覆盖（双下划线表示嵌套，如 `XIAOZHI__EXECUTION__MODE=non_blocking`）。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::react::LoopLimits;
use crate::runtime::ExecutionMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub execution: ExecutionSection,
    pub memory: MemorySection,
    pub tools: ToolsSection,
    pub llm: LlmSection,
}

/// [app] 段
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [agent] 段：ReAct 循环预算与提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 每个会话最多步数（重试也占用步数）
    pub max_steps: usize,
    /// Oracle 输出不可解析/调用失败的累计上限
    pub max_parse_retries: usize,
    /// 工具失败的累计上限（按会话计，不按工具）
    pub max_tool_retries: usize,
    /// 自定义 system prompt 文件；不存在时使用内置提示词
    pub system_prompt_path: Option<PathBuf>,
}

impl Default for AgentSection {
    fn default() -> Self {
        let limits = LoopLimits::default();
        Self {
            max_steps: limits.max_steps,
            max_parse_retries: limits.max_parse_retries,
            max_tool_retries: limits.max_tool_retries,
            system_prompt_path: None,
        }
    }
}

impl AgentSection {
    pub fn limits(&self) -> LoopLimits {
        LoopLimits {
            max_steps: self.max_steps,
            max_parse_retries: self.max_parse_retries,
            max_tool_retries: self.max_tool_retries,
        }
    }
}

/// [execution] 段：阻塞 / 非阻塞模式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub mode: ExecutionMode,
    /// 非阻塞模式下取消后等待进行中调用的宽限期（毫秒）
    pub abort_grace_ms: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Blocking,
            abort_grace_ms: 3000,
        }
    }
}

impl ExecutionSection {
    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }
}

/// [memory] 段：跨会话记忆
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// JSON Lines 文件路径
    pub path: PathBuf,
    /// 记忆窗口（秒），含边界
    pub window_secs: i64,
    /// 关闭时从文件中移除超出窗口的历史
    pub compact_on_shutdown: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/memory.jsonl"),
            window_secs: 300,
            compact_on_shutdown: true,
        }
    }
}

impl MemorySection {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.max(0))
    }
}

/// [tools] 段：调用/连接超时、本地应用白名单、降级映射
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 重量级 Provider（浏览器自动化）连接超时（秒）
    pub heavy_connect_timeout_secs: u64,
    /// 轻量级 Provider（桌面控制、分析）连接超时（秒）
    pub light_connect_timeout_secs: u64,
    pub launch: LaunchSection,
    pub fallbacks: Vec<FallbackEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            heavy_connect_timeout_secs: 120,
            light_connect_timeout_secs: 60,
            launch: LaunchSection::default(),
            fallbacks: Vec::new(),
        }
    }
}

impl ToolsSection {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// [tools.launch] 段：launch_app 可启动的应用（别名 -> 可执行文件）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LaunchSection {
    pub allowed_apps: BTreeMap<String, String>,
}

impl Default for LaunchSection {
    fn default() -> Self {
        let allowed_apps = [
            ("记事本", "notepad.exe"),
            ("计算器", "calc.exe"),
            ("画图", "mspaint.exe"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { allowed_apps }
    }
}

/// [[tools.fallbacks]]：tool 的主 Provider 启动失败时改用 provider 的 target 工具
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackEntry {
    pub tool: String,
    pub provider: String,
    pub target: String,
}

/// [llm] 段：OpenAI 兼容后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: crate::llm::DEFAULT_MODEL.to_string(),
            base_url: None,
            timeout_secs: 30,
        }
    }
}

/// 从 config 目录加载配置，环境变量 XIAOZHI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 XIAOZHI__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("XIAOZHI")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
