//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供 ReAct 循环决定是提示重试、回灌失败自我修正还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::OracleParse(raw) => RecoveryAction::RetryWithPrompt(format!(
                "上一轮输出格式错误: {raw}。\
                你必须严格按照以下格式输出，且每次只执行一个动作：\
                Thought: [思考]\\nAction: [工具名]\\nAction Input: {{\"参数\": \"值\"}}。\
                任务完成时输出 Thought: [思考]\\nFinal Answer: [结果]。"
            )),
            AgentError::OracleTransport(_) => RecoveryAction::RetryWithPrompt(
                "上一轮推理请求失败，请基于当前信息重新决定下一步。".to_string(),
            ),
            AgentError::ToolUnavailable(msg) => RecoveryAction::SelfCorrect(format!(
                "工具暂不可用（{msg}）。可以重试一次，或换一个可用工具完成任务。"
            )),
            AgentError::ProviderStartupTimeout { provider, secs } => {
                RecoveryAction::SelfCorrect(format!(
                    "{provider} 在 {secs} 秒内未就绪，请换用其他 Provider 提供的工具完成任务。"
                ))
            }
            AgentError::ToolExecution(msg) => RecoveryAction::SelfCorrect(format!(
                "工具执行失败: {msg}。请检查参数或换一种方式。"
            )),
            _ => RecoveryAction::Abort,
        }
    }
}
