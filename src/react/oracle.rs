//! 推理 Oracle：把上下文转为下一步决策
//!
//! ReasoningLoop 只依赖 ReasoningOracle trait；LlmOracle 为基于 LlmClient 的默认实现。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::{parse_decision, render_system_prompt, render_user_message, OracleContext};
use crate::tools::ToolCall;

/// 响应日志预览最大字符数
const RESPONSE_PREVIEW_CHARS: usize = 300;

/// Oracle 的一次决策
#[derive(Clone, Debug, PartialEq)]
pub enum Decision {
    /// 调用一个工具
    Action { thought: String, call: ToolCall },
    /// 结束会话并给出回答
    FinalAnswer { thought: String, text: String },
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// 输出不可解析返回 OracleParse，调用失败或超时返回 OracleTransport
    async fn decide(&self, ctx: &OracleContext<'_>) -> Result<Decision, AgentError>;
}

/// 基于 LLM 的 Oracle：system prompt（含工具说明）+ 单条 user 消息（任务、记忆、已执行步骤）
pub struct LlmOracle {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmOracle {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }
}

#[async_trait]
impl ReasoningOracle for LlmOracle {
    async fn decide(&self, ctx: &OracleContext<'_>) -> Result<Decision, AgentError> {
        let messages = [
            Message::system(render_system_prompt(&self.system_prompt, ctx.tools)),
            Message::user(render_user_message(ctx)),
        ];
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::OracleTransport)?;
        tracing::debug!(
            step = ctx.steps.len(),
            response = %raw.chars().take(RESPONSE_PREVIEW_CHARS).collect::<String>(),
            "oracle response"
        );
        parse_decision(&raw)
    }
}
