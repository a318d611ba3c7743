//! 执行模式：阻塞调用 / 可取消的后台任务，共用同一个 ReasoningLoop

pub mod adapter;
pub mod sink;

pub use adapter::{ExecutionMode, ExecutionModeAdapter, SessionDrain, SessionHandle};
pub use sink::{AnswerSink, TracingSink};
