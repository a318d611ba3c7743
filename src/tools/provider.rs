//! 能力提供方（Tool Provider）抽象
//!
//! 桌面控制、浏览器自动化、多模态分析等异构服务统一实现 ToolProvider；
//! ToolChannelManager 只按注册时声明的能力路由，不关心 Provider 的具体类型。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 重量级 Provider（浏览器自动化）默认连接超时
pub const HEAVY_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// 轻量级 Provider（桌面控制、分析）默认连接超时
pub const LIGHT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider 类别，决定默认连接超时
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    Desktop,
    Browser,
    Analysis,
}

impl ProviderClass {
    /// 首次使用可能需要数分钟就绪
    pub fn is_heavy(&self) -> bool {
        matches!(self, ProviderClass::Browser)
    }

    pub fn default_connect_timeout(&self) -> Duration {
        if self.is_heavy() {
            HEAVY_CONNECT_TIMEOUT
        } else {
            LIGHT_CONNECT_TIMEOUT
        }
    }
}

/// 工具描述（供 Oracle 理解）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// 注册时声明的能力：工具列表与可选的连接超时覆盖
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub tools: Vec<ToolSpec>,
    /// 为 None 时按 ProviderClass 取默认值
    pub connect_timeout: Option<Duration>,
}

impl Capabilities {
    pub fn new(tools: Vec<ToolSpec>) -> Self {
        Self {
            tools,
            connect_timeout: None,
        }
    }

    /// 只有名字、无描述的能力（测试或简单 Provider）
    pub fn from_names(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| ToolSpec::new(*n, "")).collect())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// 外部能力提供方
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Provider 名称（注册表内唯一）
    fn name(&self) -> &str;

    fn class(&self) -> ProviderClass;

    /// 建立连接；完成前不会收到 call。默认立即就绪
    async fn connect(&self) -> Result<(), String> {
        Ok(())
    }

    /// 执行一次工具调用，tool 为 Provider 侧的工具名
    async fn call(&self, tool: &str, args: Value) -> Result<String, String>;

    /// 是否允许在取消时放弃正在进行的调用（结果到达后丢弃）
    fn supports_abort(&self) -> bool {
        true
    }
}
