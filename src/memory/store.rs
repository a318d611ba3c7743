//! 跨会话记忆存储
//!
//! 追加写的 JSON Lines 文件：每次会话结束写入一条 {timestamp, command, outcome}，
//! append 返回前已 fsync。读取时按时间窗口惰性过滤（`now - timestamp <= window`，含边界），
//! 不会主动删除条目。compact 只在关闭时重写文件，去掉超出配置窗口的历史；
//! 内存中的条目保持不变，因此本进程内任意窗口的读取结果不受影响，
//! 重启后不超过配置窗口的读取结果也不受影响。
//!
//! 读路径只克隆一份 `Arc<Vec<_>>` 快照，写路径在 writer 锁内写盘后再发布新快照（写时复制）。

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::AgentError;

/// 一条会话摘要
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub outcome: String,
}

impl MemoryEntry {
    pub fn new(command: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self::at(Utc::now(), command, outcome)
    }

    pub fn at(
        timestamp: DateTime<Utc>,
        command: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            command: command.into(),
            outcome: outcome.into(),
        }
    }
}

/// 时间窗口记忆存储；path 为 None 时仅驻留内存（测试或禁用持久化）
#[derive(Debug)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    window: Duration,
    snapshot: RwLock<Arc<Vec<MemoryEntry>>>,
    /// 串行化写入；Some 时为已打开的追加句柄
    writer: Mutex<Option<fs::File>>,
}

impl MemoryStore {
    pub fn in_memory(window: Duration) -> Self {
        Self {
            path: None,
            window,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(None),
        }
    }

    /// 打开（或创建）文件存储并重新加载已持久化的条目；已过期的条目保留在内存中，只是读取时不返回
    pub async fn open(path: impl AsRef<Path>, window: Duration) -> Result<Self, AgentError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let entries = load_entries(&path).await?;
        tracing::info!(path = %path.display(), entries = entries.len(), "memory store loaded");
        Ok(Self {
            path: Some(path),
            window,
            snapshot: RwLock::new(Arc::new(entries)),
            writer: Mutex::new(None),
        })
    }

    /// 配置的默认窗口
    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 追加一条记录；返回前已写盘并 fsync
    pub async fn append(&self, entry: MemoryEntry) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        if let Some(path) = &self.path {
            let mut line =
                serde_json::to_string(&entry).map_err(|e| AgentError::Memory(e.to_string()))?;
            line.push('\n');
            if writer.is_none() {
                *writer = Some(open_append(path).await?);
            }
            let Some(file) = writer.as_mut() else {
                return Err(AgentError::Memory("memory writer unavailable".to_string()));
            };
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            file.sync_data().await?;
        }
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        Arc::make_mut(&mut *snapshot).push(entry);
        Ok(())
    }

    /// 返回 `now - timestamp <= window` 的全部条目（含边界），按时间先后排序
    pub fn read_window(&self, now: DateTime<Utc>, window: Duration) -> Vec<MemoryEntry> {
        let snapshot = self.snapshot();
        let mut entries: Vec<MemoryEntry> = snapshot
            .iter()
            .filter(|e| now.signed_duration_since(e.timestamp) <= window)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    /// 使用配置窗口读取
    pub fn recent(&self, now: DateTime<Utc>) -> Vec<MemoryEntry> {
        self.read_window(now, self.window)
    }

    /// 当前全部条目的快照（不过滤）
    pub fn snapshot(&self) -> Arc<Vec<MemoryEntry>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn flush(&self) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        if let Some(file) = writer.as_mut() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// 按配置窗口压缩文件：只保留窗口内条目（临时文件 + rename），返回从文件中移除的条数。
    /// 不修改内存快照。
    pub async fn compact(&self, now: DateTime<Utc>) -> Result<usize, AgentError> {
        let mut writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        let kept: Vec<MemoryEntry> = snapshot
            .iter()
            .filter(|e| now.signed_duration_since(e.timestamp) <= self.window)
            .cloned()
            .collect();
        let removed = snapshot.len() - kept.len();
        let Some(path) = &self.path else {
            return Ok(0);
        };
        if removed == 0 {
            return Ok(0);
        }

        let tmp = path.with_extension("jsonl.tmp");
        let mut body = String::new();
        for entry in &kept {
            body.push_str(
                &serde_json::to_string(entry).map_err(|e| AgentError::Memory(e.to_string()))?,
            );
            body.push('\n');
        }
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        // 旧句柄指向被替换的文件，下次 append 重新打开
        *writer = None;
        fs::rename(&tmp, path).await?;

        tracing::info!(removed, "memory file compacted");
        Ok(removed)
    }
}

async fn open_append(path: &Path) -> Result<fs::File, AgentError> {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| AgentError::Memory(format!("{}: {}", path.display(), e)))?;
    Ok(file)
}

async fn load_entries(path: &Path) -> Result<Vec<MemoryEntry>, AgentError> {
    let data = match fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(line = lineno + 1, error = %e, "skipping malformed memory entry");
            }
        }
    }
    Ok(entries)
}
