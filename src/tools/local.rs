//! 进程内 Provider：把一个 ToolRegistry 作为整体注册到 ToolChannelManager

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Capabilities, ProviderClass, ToolProvider, ToolRegistry};

pub struct LocalProvider {
    name: String,
    class: ProviderClass,
    registry: ToolRegistry,
}

impl LocalProvider {
    pub fn new(name: impl Into<String>, class: ProviderClass, registry: ToolRegistry) -> Self {
        Self {
            name: name.into(),
            class,
            registry,
        }
    }

    /// 以注册表中的全部工具作为能力声明
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(self.registry.tool_specs())
    }
}

#[async_trait]
impl ToolProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> ProviderClass {
        self.class
    }

    async fn call(&self, tool: &str, args: Value) -> Result<String, String> {
        self.registry.execute(tool, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_local_provider_dispatches_to_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let provider = LocalProvider::new("local", ProviderClass::Desktop, registry);

        let caps = provider.capabilities();
        assert_eq!(caps.tools.len(), 1);
        assert_eq!(caps.tools[0].name, "echo");

        let out = provider
            .call("echo", serde_json::json!({"text": "你好"}))
            .await
            .unwrap();
        assert_eq!(out, "你好");
        assert!(provider.call("missing", Value::Null).await.is_err());
    }
}
