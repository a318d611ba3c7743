//! Action 输出格式的 JSON Schema（schemars 生成）
//!
//! 拼入 system prompt，减少 Oracle 输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// 单步决策格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ActionFormat {
    /// 对当前情况的分析
    pub thought: String,
    /// 工具名，如 launch_app、echo
    pub action: String,
    /// 工具参数对象，键唯一
    pub action_input: HashMap<String, serde_json::Value>,
}

/// 返回 Action 格式的 JSON Schema 字符串
pub fn action_schema_json() -> String {
    let schema = schema_for!(ActionFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
