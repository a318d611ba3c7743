//! 核心层：错误与恢复、会话数据模型、中断控制、优雅关闭

pub mod error;
pub mod interrupt;
pub mod recovery;
pub mod session;
pub mod shutdown;

pub use error::{AgentError, RecoveryAction};
pub use interrupt::InterruptionController;
pub use recovery::RecoveryEngine;
pub use session::{
    FailureKind, Observation, Session, SessionId, SessionStatus, Step, TaskResult,
};
pub use shutdown::{
    MemoryFlush, ShutdownCoordinator, ShutdownHook, ShutdownManager, ShutdownReason,
};
