//! 认知层：Oracle 抽象与输出解析、上下文组装、ReAct 主循环、会话事件

pub mod context;
pub mod events;
pub mod loop_;
pub mod oracle;
pub mod parser;

pub use context::{
    format_tool_descriptions, render_system_prompt, render_user_message, OracleContext,
    DEFAULT_SYSTEM_PROMPT,
};
pub use events::SessionEvent;
pub use loop_::{AbortPolicy, LoopLimits, ReasoningLoop, RunOptions, DEFAULT_ABORT_GRACE};
pub use oracle::{Decision, LlmOracle, ReasoningOracle};
pub use parser::parse_decision;
