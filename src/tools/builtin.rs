//! 内置本地工具：echo（联调用）、launch_app（按白名单启动桌面应用）

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::Tool;

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "回显文本（联调用）"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "要回显的文本" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(text.to_string())
    }
}

/// 启动应用：app_name 必须是白名单中的别名（如 记事本 -> notepad.exe）
pub struct LaunchAppTool {
    allowed_apps: BTreeMap<String, String>,
}

impl LaunchAppTool {
    pub fn new(allowed_apps: BTreeMap<String, String>) -> Self {
        Self { allowed_apps }
    }

    fn resolve(&self, app_name: &str) -> Option<&str> {
        self.allowed_apps
            .get(app_name)
            .or_else(|| self.allowed_apps.get(&app_name.to_lowercase()))
            .map(String::as_str)
    }
}

#[async_trait]
impl Tool for LaunchAppTool {
    fn name(&self) -> &str {
        "launch_app"
    }

    fn description(&self) -> &str {
        "启动桌面应用"
    }

    fn parameters_schema(&self) -> Value {
        let names: Vec<&String> = self.allowed_apps.keys().collect();
        serde_json::json!({
            "type": "object",
            "properties": {
                "app_name": {
                    "type": "string",
                    "description": format!("应用名，可选: {:?}", names)
                }
            },
            "required": ["app_name"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let app_name = args
            .get("app_name")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Missing argument: app_name".to_string())?;
        let program = self
            .resolve(app_name)
            .ok_or_else(|| format!("App not allowed: {app_name}"))?;

        // 只负责拉起进程，不等待其退出
        tokio::process::Command::new(program)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| format!("Failed to launch {app_name}: {e}"))?;
        Ok(format!("已启动 {app_name}"))
    }
}
