//! Oracle 输出解析
//!
//! 主格式为文本协议：
//! ```text
//! Thought: ...
//! Action: 工具名
//! Action Input: {"param": "value"}
//! ```
//! 或 `Final Answer: ...`（同时出现时以 Final Answer 为准）。
//! 兼容 JSON 形式 `{"tool": "...", "args": {...}}`（可包在 ```json 代码块中）。

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::react::Decision;
use crate::tools::ToolCall;

const FINAL_ANSWER_MARKER: &str = "Final Answer:";
const ACTION_INPUT_MARKER: &str = "Action Input:";
/// 错误信息中保留的原文最大字符数
const RAW_PREVIEW_CHARS: usize = 300;

fn thought_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)Thought:\s*(.*?)(?:\n\s*(?:Action|Final Answer)|\z)").expect("valid regex")
    })
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*Action:[ \t]*(.*?)[ \t]*$").expect("valid regex"))
}

fn literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(True|False|None)\b").expect("valid regex"))
}

/// JSON 兼容格式
#[derive(Deserialize)]
struct JsonToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    thought: String,
}

/// 解析一次 Oracle 输出
pub fn parse_decision(output: &str) -> Result<Decision, AgentError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(AgentError::OracleParse("(empty response)".to_string()));
    }
    let thought = extract_thought(trimmed);

    if let Some(idx) = trimmed.find(FINAL_ANSWER_MARKER) {
        let text = trimmed[idx + FINAL_ANSWER_MARKER.len()..].trim();
        if text.is_empty() {
            return Err(parse_error("empty Final Answer", trimmed));
        }
        return Ok(Decision::FinalAnswer {
            thought,
            text: text.to_string(),
        });
    }

    if let Some(caps) = action_re().captures(trimmed) {
        let tool = caps
            .get(1)
            .map(|m| m.as_str().trim_matches(|c: char| c == '`' || c == '*' || c.is_whitespace()))
            .unwrap_or("");
        if tool.is_empty() {
            return Err(parse_error("empty Action", trimmed));
        }
        let args = extract_action_input(trimmed)?;
        return Ok(Decision::Action {
            thought,
            call: ToolCall::new(tool, args),
        });
    }

    parse_json_fallback(trimmed)
}

fn extract_thought(text: &str) -> String {
    thought_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// 缺少 Action Input 或其后为空时视为无参数；其余内容必须是 JSON 对象
fn extract_action_input(text: &str) -> Result<Map<String, Value>, AgentError> {
    let Some(idx) = text.find(ACTION_INPUT_MARKER) else {
        return Ok(Map::new());
    };
    let mut rest = text[idx + ACTION_INPUT_MARKER.len()..].trim_start();
    if let Some(fenced) = rest.strip_prefix("```") {
        rest = fenced.trim_start_matches("json").trim_start();
    }
    if rest.is_empty() {
        return Ok(Map::new());
    }
    if !rest.starts_with('{') {
        return Err(parse_error("Action Input is not a JSON object", text));
    }
    let json_str = balanced_object(rest)
        .ok_or_else(|| parse_error("unbalanced braces in Action Input", text))?;
    match parse_object(json_str) {
        Some(map) => Ok(map),
        None => Err(parse_error("invalid JSON in Action Input", text)),
    }
}

/// 先按原样解析，失败后把 True / False / None 规范化为 JSON 字面量再试一次
fn parse_object(json_str: &str) -> Option<Map<String, Value>> {
    let value = serde_json::from_str::<Value>(json_str).ok().or_else(|| {
        let normalized = literal_re().replace_all(json_str, |caps: &regex::Captures| {
            let literal = match &caps[1] {
                "True" => "true",
                "False" => "false",
                _ => "null",
            };
            literal.to_string()
        });
        serde_json::from_str::<Value>(&normalized).ok()
    })?;
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// 从以 `{` 开头的文本中截取配对的 JSON 对象，忽略字符串内的括号
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_json_fallback(text: &str) -> Result<Decision, AgentError> {
    let body = if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        text
    };
    let json_str = body
        .find('{')
        .and_then(|start| balanced_object(&body[start..]))
        .ok_or_else(|| parse_error("no Action or Final Answer found", text))?;
    let parsed: JsonToolCall = serde_json::from_str(json_str)
        .map_err(|e| parse_error(&format!("invalid tool call JSON: {e}"), text))?;
    if parsed.tool.trim().is_empty() {
        return Err(parse_error("empty tool name", text));
    }
    let args = match parsed.args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(parse_error("tool args is not a JSON object", text)),
    };
    Ok(Decision::Action {
        thought: parsed.thought,
        call: ToolCall::new(parsed.tool.trim(), args),
    })
}

fn parse_error(reason: &str, raw: &str) -> AgentError {
    let preview: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
    AgentError::OracleParse(format!("{reason}: {preview}"))
}
