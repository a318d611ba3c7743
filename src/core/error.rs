//! Agent 错误类型与恢复动作
//!
//! 会话级错误（解析、工具、预算、取消）在 ReAct 循环内被消化为 SessionStatus；
//! 只有基础设施错误（记忆存储不可写、后台任务崩溃等）才会以 Err 形式返回给调用方。

use thiserror::Error;

/// 编排核心中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// Oracle 输出无法解析为 Action / Final Answer
    #[error("Oracle parse error: {0}")]
    OracleParse(String),

    /// Oracle 调用失败或超时（与解析失败共用重试预算）
    #[error("Oracle transport error: {0}")]
    OracleTransport(String),

    /// 没有 Provider 提供该工具，或 Provider 未就绪
    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Provider '{provider}' not ready within {secs}s")]
    ProviderStartupTimeout { provider: String, secs: u64 },

    #[error("Step budget exceeded ({0})")]
    StepBudgetExceeded(usize),

    #[error("Cancelled by interruption")]
    CancelledByInterruption,

    /// 记忆存储不可用（属于基础设施错误，会上抛给调用方）
    #[error("Memory store error: {0}")]
    Memory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    /// 后台会话任务 panic 或被外部中止
    #[error("Session task failed: {0}")]
    TaskJoin(String),
}

impl AgentError {
    /// 是否属于 Oracle 侧错误（计入 parse-retry 预算）
    pub fn is_oracle_error(&self) -> bool {
        matches!(self, AgentError::OracleParse(_) | AgentError::OracleTransport(_))
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将格式提示注入下一轮上下文，让 Oracle 重新输出
    RetryWithPrompt(String),
    /// 将工具失败作为 Observation 回灌，让 Oracle 自行修正策略
    SelfCorrect(String),
    /// 终止当前会话
    Abort,
}

impl RecoveryAction {
    /// 注入下一轮上下文的提示；Abort 时为空
    pub fn hint(&self) -> &str {
        match self {
            RecoveryAction::RetryWithPrompt(h) | RecoveryAction::SelfCorrect(h) => h,
            RecoveryAction::Abort => "",
        }
    }
}
