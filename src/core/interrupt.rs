//! 中断控制：每个活跃会话一个取消令牌
//!
//! 新的唤醒事件到来时，由上层对当前会话调用 signal；ReAct 循环与执行模式适配器在检查点读取。
//! 所有会话令牌都是根令牌（进程关闭）的子令牌，关闭时会一并取消。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::SessionId;

/// 会话级取消总线：只记录令牌，不含任何会话逻辑
#[derive(Debug)]
pub struct InterruptionController {
    root: CancellationToken,
    tokens: Mutex<HashMap<SessionId, CancellationToken>>,
}

impl InterruptionController {
    pub fn new() -> Self {
        Self::with_parent(CancellationToken::new())
    }

    /// 以关闭令牌为父：进程关闭时所有会话同时被取消
    pub fn with_parent(root: CancellationToken) -> Self {
        Self {
            root,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// 为新会话登记令牌并返回；重复登记返回同一个令牌
    pub fn begin(&self, id: SessionId) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens
            .entry(id)
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 取消指定会话；幂等，返回该会话是否仍在登记中
    pub fn signal(&self, id: SessionId) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match tokens.get(&id) {
            Some(token) => {
                if !token.is_cancelled() {
                    tracing::info!(session = %id, "interruption signalled");
                }
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, id: SessionId) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.get(&id).map(|t| t.is_cancelled()).unwrap_or(false)
    }

    /// 会话结束时注销
    pub fn end(&self, id: SessionId) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for InterruptionController {
    fn default() -> Self {
        Self::new()
    }
}
