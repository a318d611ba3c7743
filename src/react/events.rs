//! 会话过程事件：非阻塞模式下推送给下游（语音输出、日志、前端）

use serde::Serialize;

use crate::core::{FailureKind, SessionId, Step};

/// 单个会话的增量事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        session_id: SessionId,
        command: String,
    },
    /// 正在请求 Oracle 决策（step 为即将追加的 Step 序号）
    Thinking { step: usize, max_steps: usize },
    /// 即将调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    StepAppended { step: Step },
    /// 错误恢复动作（retry_with_prompt / self_correct / abort）
    Recovery { action: String, detail: String },
    Completed { text: String },
    Failed { reason: FailureKind, text: String },
    Cancelled,
    Exhausted { max_steps: usize },
}

impl SessionEvent {
    /// 是否为终态事件（每个会话恰好一个）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Completed { .. }
                | SessionEvent::Failed { .. }
                | SessionEvent::Cancelled
                | SessionEvent::Exhausted { .. }
        )
    }
}
