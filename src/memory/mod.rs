//! 记忆层：LLM 消息类型与跨会话时间窗口记忆

pub mod message;
pub mod store;

pub use message::{Message, Role};
pub use store::{MemoryEntry, MemoryStore};
