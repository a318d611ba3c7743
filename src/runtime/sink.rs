//! 最终回答的下游交付（语音合成等）

use async_trait::async_trait;

use crate::core::TaskResult;

/// 会话结束后接收结果；已被新会话取代（Cancelled）的结果不会交付
#[async_trait]
pub trait AnswerSink: Send + Sync {
    async fn deliver(&self, result: &TaskResult);
}

/// 只写日志的默认实现（未接入语音合成时使用）
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl AnswerSink for TracingSink {
    async fn deliver(&self, result: &TaskResult) {
        tracing::info!(
            session = %result.session_id,
            status = result.status.label(),
            answer = %result.final_text,
            "answer ready for speech output"
        );
    }
}
