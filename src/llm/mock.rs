//! Mock LLM 客户端（无需 API）
//!
//! 取第一条 User 消息中的任务，直接给出 Final Answer，便于本地跑通整条链路。

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let task = messages
            .iter()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.content.lines().next())
            .map(|line| line.trim_start_matches("用户任务:").trim())
            .unwrap_or("(no input)");

        Ok(format!(
            "Thought: 本地模式，无需调用工具\nFinal Answer: 已收到命令：{}",
            task
        ))
    }
}
