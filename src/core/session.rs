//! 会话数据模型：Session、Step、SessionStatus、TaskResult
//!
//! 一个 Session 对应一次命令执行；Step 为 ReAct 循环的一次迭代，追加后不可修改，构成审计轨迹。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tools::{ToolCall, ToolResult};

/// outcome 摘要写入记忆时的最大字符数
const SUMMARY_MAX_CHARS: usize = 200;

/// 会话 ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Failed 状态的具体原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Oracle 输出连续不可解析（或调用失败），超过 parse-retry 上限
    OracleParseError,
    /// 工具失败次数超过 tool-retry 上限
    ToolExecutionError,
}

/// 会话状态；除 Running 外均为终态，进入终态后不可再迁移
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed(FailureKind),
    Cancelled,
    Exhausted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed(_) => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Exhausted => "exhausted",
        }
    }
}

/// 单步观察结果
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    /// 工具调用结果（成功或失败）；失败时 hint 为注入下一轮的修正提示
    Tool {
        result: ToolResult,
        #[serde(skip_serializing_if = "String::is_empty")]
        hint: String,
    },
    /// Oracle 给出的最终回答
    FinalAnswer { text: String },
    /// Oracle 输出不可解析或调用失败；hint 为注入下一轮的修正提示
    OracleError { message: String, hint: String },
}

/// ReAct 循环的一次迭代
#[derive(Clone, Debug, Serialize)]
pub struct Step {
    pub index: usize,
    pub thought: String,
    /// 本步调用的工具；Final Answer 或 Oracle 错误时为 None
    pub action: Option<ToolCall>,
    pub observation: Observation,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn tool(result: ToolResult) -> Self {
        Observation::Tool {
            result,
            hint: String::new(),
        }
    }
}

impl Step {
    pub fn is_tool_failure(&self) -> bool {
        matches!(&self.observation, Observation::Tool { result, .. } if !result.is_success())
    }
}

/// 一次命令执行
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub command: String,
    steps: Vec<Step>,
    status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: SessionId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            steps: Vec::new(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// 追加一步，index 由当前长度决定，保证从 0 严格递增
    pub fn push_step(
        &mut self,
        thought: impl Into<String>,
        action: Option<ToolCall>,
        observation: Observation,
    ) -> &Step {
        let index = self.steps.len();
        self.steps.push(Step {
            index,
            thought: thought.into(),
            action,
            observation,
            timestamp: Utc::now(),
        });
        &self.steps[index]
    }

    /// 进入终态；已是终态或目标非终态时返回 false 且不做任何修改
    pub fn finish(&mut self, status: SessionStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }

    pub fn into_result(self, final_text: String, parse_retries: usize, tool_retries: usize) -> TaskResult {
        TaskResult {
            session_id: self.id,
            command: self.command,
            status: self.status,
            steps: self.steps,
            final_text,
            parse_retries,
            tool_retries,
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

/// 会话终态结果：交给语音合成与日志
#[derive(Clone, Debug, Serialize)]
pub struct TaskResult {
    pub session_id: SessionId,
    pub command: String,
    pub status: SessionStatus,
    pub steps: Vec<Step>,
    pub final_text: String,
    /// 本会话 Oracle 解析/调用失败次数
    pub parse_retries: usize,
    /// 本会话工具失败次数
    pub tool_retries: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// 写入记忆的结果摘要
    pub fn outcome_summary(&self) -> String {
        let text: String = self.final_text.chars().take(SUMMARY_MAX_CHARS).collect();
        let text = if self.final_text.chars().count() > SUMMARY_MAX_CHARS {
            format!("{}...", text)
        } else {
            text
        };
        format!("[{}] {}", self.status.label(), text)
    }

    /// 实际调用过工具的步数
    pub fn tool_calls(&self) -> usize {
        self.steps.iter().filter(|s| s.action.is_some()).count()
    }
}
