//! Oracle 上下文组装
//!
//! 每轮迭代由命令、已追加的 Step 与会话开始时读取的近期记忆组成；
//! render_* 把它们渲染成 LLM 的 system / user 消息。

use crate::core::{Observation, Step};
use crate::memory::MemoryEntry;
use crate::tools::{action_schema_json, ToolSpec};

/// 一轮决策的输入（只读借用会话状态）
#[derive(Clone, Copy, Debug)]
pub struct OracleContext<'a> {
    pub command: &'a str,
    pub steps: &'a [Step],
    pub memory: &'a [MemoryEntry],
    pub tools: &'a [ToolSpec],
}

impl<'a> OracleContext<'a> {
    pub fn new(
        command: &'a str,
        steps: &'a [Step],
        memory: &'a [MemoryEntry],
        tools: &'a [ToolSpec],
    ) -> Self {
        Self {
            command,
            steps,
            memory,
            tools,
        }
    }

    /// 最近一步留下的修正提示（Oracle 输出错误或工具失败）
    pub fn last_hint(&self) -> Option<&'a str> {
        match self.steps.last().map(|s| &s.observation) {
            Some(Observation::OracleError { hint, .. } | Observation::Tool { hint, .. })
                if !hint.is_empty() =>
            {
                Some(hint.as_str())
            }
            _ => None,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "你是一个语音助手，通过调用工具完成用户的语音命令。\n\n\
按照 ReAct 框架思考和行动：\n\
1. Thought: 分析当前情况，思考下一步\n\
2. Action: 选择一个工具执行\n\
3. Action Input: 提供工具参数（JSON 对象）\n\
4. Observation: 观察执行结果（由系统提供）\n\
5. 重复以上步骤直到完成";

/// system 消息：基础提示 + 工具说明 + 输出格式与规则
pub fn render_system_prompt(base: &str, tools: &[ToolSpec]) -> String {
    format!(
        "{base}\n\n可用工具：\n{tools}\n\n输出格式：\n\
Thought: [你的思考过程]\n\
Action: [工具名称]\n\
Action Input: {{\"param\": \"value\"}}\n\n\
如果任务完成，输出：\n\
Thought: 任务已完成\n\
Final Answer: [总结结果]\n\n\
重要规则：\n\
1. 每次只执行一个动作\n\
2. 如果任务不清晰或无法理解，直接返回 Final Answer 说明原因\n\
3. 工具失败时根据 Observation 修正参数或换用其他工具\n\n\
Action 结构（JSON Schema）：\n{schema}",
        base = base.trim_end(),
        tools = format_tool_descriptions(tools),
        schema = action_schema_json(),
    )
}

/// 工具说明：名称、描述、参数（标注必需/可选）
pub fn format_tool_descriptions(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return "暂无可用工具".to_string();
    }
    let mut lines = Vec::new();
    for tool in tools {
        let required: Vec<&str> = tool
            .parameters
            .get("required")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        let params: Vec<String> = tool
            .parameters
            .get("properties")
            .and_then(|v| v.as_object())
            .map(|props| {
                props
                    .iter()
                    .map(|(name, info)| {
                        let ty = info.get("type").and_then(|v| v.as_str()).unwrap_or("any");
                        let desc = info.get("description").and_then(|v| v.as_str()).unwrap_or("");
                        let flag = if required.contains(&name.as_str()) { "必需" } else { "可选" };
                        format!("    - {name} ({ty}, {flag}): {desc}")
                    })
                    .collect()
            })
            .unwrap_or_default();
        if params.is_empty() {
            lines.push(format!("- {}: {}", tool.name, tool.description));
        } else {
            lines.push(format!(
                "- {}: {}\n  参数:\n{}",
                tool.name,
                tool.description,
                params.join("\n")
            ));
        }
    }
    lines.join("\n")
}

/// user 消息：任务 + 近期记忆 + 已执行步骤（含观察与修正提示）
pub fn render_user_message(ctx: &OracleContext<'_>) -> String {
    let mut out = format!("用户任务: {}\n", ctx.command);

    if !ctx.memory.is_empty() {
        out.push_str("\n最近的对话记录:\n");
        for entry in ctx.memory {
            out.push_str(&format!(
                "- [{}] {} -> {}\n",
                entry.timestamp.format("%H:%M:%S"),
                entry.command,
                entry.outcome
            ));
        }
    }

    if !ctx.steps.is_empty() {
        out.push_str("\n已执行步骤:\n");
        for step in ctx.steps {
            out.push_str(&format!("\nStep {}:\n", step.index + 1));
            if !step.thought.is_empty() {
                out.push_str(&format!("Thought: {}\n", step.thought));
            }
            if let Some(call) = &step.action {
                out.push_str(&format!("Action: {}\n", call.tool));
                out.push_str(&format!("Action Input: {}\n", call.args_value()));
            }
            match &step.observation {
                Observation::Tool { result, .. } => {
                    out.push_str(&format!("Observation: {}\n", result.observation_text()))
                }
                Observation::FinalAnswer { text } => {
                    out.push_str(&format!("Final Answer: {}\n", text))
                }
                Observation::OracleError { message, .. } => {
                    out.push_str(&format!("Observation: 上一次输出无法解析 ({})\n", message))
                }
            }
        }
    }

    if let Some(hint) = ctx.last_hint() {
        out.push_str(&format!("\n提示: {}\n", hint));
    }
    out.push_str("\n请分析当前情况，决定下一步动作。");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Session, SessionId};
    use crate::tools::{ToolCall, ToolResult};
    use std::time::Duration;

    #[test]
    fn test_tool_descriptions_mark_required() {
        let spec = ToolSpec::new("launch_app", "启动桌面应用").with_parameters(serde_json::json!({
            "type": "object",
            "properties": {
                "app_name": {"type": "string", "description": "应用名"},
                "args": {"type": "string"}
            },
            "required": ["app_name"]
        }));
        let text = format_tool_descriptions(&[spec, ToolSpec::new("screenshot", "截图")]);
        assert!(text.contains("app_name (string, 必需): 应用名"));
        assert!(text.contains("args (string, 可选)"));
        assert!(text.contains("- screenshot: 截图"));
        assert_eq!(format_tool_descriptions(&[]), "暂无可用工具");
    }

    #[test]
    fn test_user_message_includes_steps_memory_and_hint() {
        let mut session = Session::new(SessionId::new(), "打开记事本");
        let call = ToolCall::from_json("launch_app", serde_json::json!({"app_name": "记事本"}));
        session.push_step(
            "先启动",
            Some(call),
            Observation::tool(ToolResult::success(
                "launch_app",
                Some("desktop".into()),
                "已启动 记事本",
                Duration::from_millis(5),
            )),
        );
        session.push_step(
            "",
            None,
            Observation::OracleError {
                message: "empty Action".into(),
                hint: "请按格式输出".into(),
            },
        );
        let memory = vec![MemoryEntry::new("打开浏览器", "[completed] 已打开")];
        let ctx = OracleContext::new(&session.command, session.steps(), &memory, &[]);
        let text = render_user_message(&ctx);

        assert!(text.starts_with("用户任务: 打开记事本"));
        assert!(text.contains("打开浏览器 -> [completed] 已打开"));
        assert!(text.contains("Step 1:"));
        assert!(text.contains("Observation: 已启动 记事本"));
        assert!(text.contains("Step 2:"));
        assert!(text.contains("提示: 请按格式输出"));
    }

    #[test]
    fn test_tool_failure_hint_reaches_next_context() {
        let mut session = Session::new(SessionId::new(), "点击确定");
        session.push_step(
            "点击按钮",
            Some(ToolCall::from_json("click", serde_json::json!({"target": "确定"}))),
            Observation::Tool {
                result: ToolResult::failure(
                    "click",
                    Some("desktop".into()),
                    crate::tools::ToolErrorKind::Execution,
                    "element not found",
                    Duration::from_millis(5),
                ),
                hint: "工具执行失败: element not found。请检查参数或换一种方式。".into(),
            },
        );
        let ctx = OracleContext::new(&session.command, session.steps(), &[], &[]);
        let text = render_user_message(&ctx);
        assert!(text.contains("Observation: Error: element not found"));
        assert!(text.contains("提示: 工具执行失败: element not found。请检查参数"));
    }

    #[test]
    fn test_system_prompt_lists_tools_and_format() {
        let prompt = render_system_prompt(DEFAULT_SYSTEM_PROMPT, &[ToolSpec::new("echo", "回显")]);
        assert!(prompt.contains("- echo: 回显"));
        assert!(prompt.contains("Final Answer"));
        assert!(prompt.contains("action_input"));
    }
}
