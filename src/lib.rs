//! 小智 - 语音命令执行助手的任务编排核心
//!
//! 一条识别出的语音命令 -> 多步推理（ReAct）-> 经工具通道调用桌面 / 浏览器 / 分析等 Provider -> 最终回答。
//!
//! 模块划分：
//! - **agent**: 按配置装配运行时
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、会话数据模型、中断控制、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 时间窗口跨会话记忆
//! - **observability**: 日志初始化
//! - **react**: Oracle、输出解析、上下文组装、ReAct 主循环
//! - **runtime**: 阻塞 / 非阻塞执行模式与结果交付
//! - **tools**: Provider 抽象、工具通道管理、本地工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod runtime;
pub mod tools;
