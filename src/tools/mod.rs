//! 工具层：调用/结果类型、Provider 抽象、进程内工具注册表、工具通道管理

pub mod builtin;
pub mod call;
pub mod channel;
pub mod local;
pub mod provider;
pub mod registry;
pub mod schema;

pub use builtin::{EchoTool, LaunchAppTool};
pub use call::{ToolCall, ToolErrorKind, ToolOutcome, ToolResult};
pub use channel::{ProviderHealth, SessionRouter, ToolChannelManager};
pub use local::LocalProvider;
pub use provider::{
    Capabilities, ProviderClass, ToolProvider, ToolSpec, HEAVY_CONNECT_TIMEOUT,
    LIGHT_CONNECT_TIMEOUT,
};
pub use registry::{Tool, ToolRegistry};
pub use schema::action_schema_json;
