//! 工具调用与结果
//!
//! ToolCall 为逻辑工具名 + 参数对象（键唯一）；ToolResult 创建后不可修改，携带结果标签、载荷/错误与耗时。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;

/// Oracle 决定调用的工具
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            tool: tool.into(),
            args,
        }
    }

    /// 从 JSON 构造；args 非对象时视为无参数
    pub fn from_json(tool: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(tool, args)
    }

    pub fn args_value(&self) -> Value {
        Value::Object(self.args.clone())
    }
}

/// 工具失败类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// 无 Provider 注册该工具
    Unavailable,
    /// Provider 在连接超时内未就绪
    StartupTimeout { secs: u64 },
    /// 单次调用超时
    Timeout,
    /// Provider 返回失败
    Execution,
}

impl ToolErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ToolErrorKind::Unavailable => "unavailable",
            ToolErrorKind::StartupTimeout { .. } => "startup_timeout",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::Execution => "execution",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success { payload: String },
    Failure { kind: ToolErrorKind, message: String },
}

/// 一次工具调用的结果
#[derive(Clone, Debug, Serialize)]
pub struct ToolResult {
    pub tool: String,
    /// 实际处理该调用的 Provider；未解析到 Provider 时为 None
    pub provider: Option<String>,
    pub outcome: ToolOutcome,
    pub latency: Duration,
}

impl ToolResult {
    pub fn success(
        tool: impl Into<String>,
        provider: Option<String>,
        payload: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            tool: tool.into(),
            provider,
            outcome: ToolOutcome::Success {
                payload: payload.into(),
            },
            latency,
        }
    }

    pub fn failure(
        tool: impl Into<String>,
        provider: Option<String>,
        kind: ToolErrorKind,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            tool: tool.into(),
            provider,
            outcome: ToolOutcome::Failure {
                kind,
                message: message.into(),
            },
            latency,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Success { .. })
    }

    /// 供 Oracle 阅读的观察文本
    pub fn observation_text(&self) -> String {
        match &self.outcome {
            ToolOutcome::Success { payload } if payload.is_empty() => "执行成功".to_string(),
            ToolOutcome::Success { payload } => payload.clone(),
            ToolOutcome::Failure { message, .. } => format!("Error: {}", message),
        }
    }

    /// 失败结果对应的错误（用于恢复引擎）
    pub fn to_error(&self) -> Option<AgentError> {
        match &self.outcome {
            ToolOutcome::Success { .. } => None,
            ToolOutcome::Failure { kind, message } => Some(match kind {
                ToolErrorKind::StartupTimeout { secs } => AgentError::ProviderStartupTimeout {
                    provider: self.provider.clone().unwrap_or_else(|| self.tool.clone()),
                    secs: *secs,
                },
                ToolErrorKind::Unavailable | ToolErrorKind::Timeout => {
                    AgentError::ToolUnavailable(message.clone())
                }
                ToolErrorKind::Execution => AgentError::ToolExecution(message.clone()),
            }),
        }
    }
}
