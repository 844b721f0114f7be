//! 持久化记录类型（对外暴露）
//!
//! 这里只描述记录的形状；如何落库由 `store` 模块负责。
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// 单次命令执行的编号
    ExecutionId
);
record_id!(
    /// 扫描任务编号
    ScanId
);
record_id!(BatchId);

/// 输出流标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn is_out(self) -> bool {
        matches!(self, Stream::Stdout)
    }

    pub fn from_is_out(is_out: bool) -> Self {
        if is_out { Stream::Stdout } else { Stream::Stderr }
    }
}

/// 待执行命令的描述；同时也是新建 Execution 记录的输入
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// 执行原因（自由文本），例如 `scout-repo-clone`
    pub kind: String,
    /// 交给 `sh -c` 的完整命令行
    pub command: String,
    pub workdir: Option<PathBuf>,
    /// 覆盖到继承环境之上的变量
    pub env: BTreeMap<String, String>,
    pub scan: Option<ScanId>,
}

impl CommandSpec {
    pub fn new(kind: impl Into<String>, command: impl Into<String>) -> Self {
        Self { kind: kind.into(), command: command.into(), ..Self::default() }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn for_scan(mut self, scan: ScanId) -> Self {
        self.scan = Some(scan);
        self
    }
}

/// 一次外部命令调用
///
/// 结束前 `ret`/`duration_secs` 为空；结束后只允许追加输出行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub scan: Option<ScanId>,
    pub kind: String,
    pub command: String,
    pub workdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub ret: Option<i32>,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.ret == Some(0)
    }
}

/// 捕获到的一行输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub execution: ExecutionId,
    pub stream: Stream,
    /// 同一执行、同一输出流内从 0 开始连续递增
    pub idx: u64,
    pub line: String,
}

/// 扫描流水线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanState {
    Created,
    Preparing,
    Running,
    FetchingOutput,
    Normalizing,
    Completed,
    Failed,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Created => "created",
            ScanState::Preparing => "preparing",
            ScanState::Running => "running",
            ScanState::FetchingOutput => "fetching-output",
            ScanState::Normalizing => "normalizing",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
        }
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => ScanState::Created,
            "preparing" => ScanState::Preparing,
            "running" => ScanState::Running,
            "fetching-output" => ScanState::FetchingOutput,
            "normalizing" => ScanState::Normalizing,
            "completed" => ScanState::Completed,
            "failed" => ScanState::Failed,
            other => return Err(format!("unknown scan state: {other}")),
        })
    }
}

/// 扫描请求（提交时的输入）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub repo: String,
    /// 分支、标签或 sha
    pub commit: String,
    /// 仓库内的相对扫描路径
    pub path: String,
    pub scanner: String,
    pub batch: Option<BatchId>,
}

impl ScanRequest {
    pub const DEFAULT_COMMIT: &'static str = "main";
    pub const DEFAULT_PATH: &'static str = ".";
    pub const DEFAULT_SCANNER: &'static str = "scout";

    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            commit: Self::DEFAULT_COMMIT.to_string(),
            path: Self::DEFAULT_PATH.to_string(),
            scanner: Self::DEFAULT_SCANNER.to_string(),
            batch: None,
        }
    }

    pub fn commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = commit.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn scanner(mut self, scanner: impl Into<String>) -> Self {
        self.scanner = scanner.into();
        self
    }
}

/// 一次扫描任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanExecution {
    pub id: ScanId,
    pub batch: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub repo: String,
    pub commit: String,
    /// checkout 之后解析出的精确 revision
    pub rev_hash: Option<String>,
    pub path: String,
    pub scanner: String,
    pub scanner_version: Option<String>,
    /// 仅在失败时设置
    pub errors: Option<String>,
    pub state: ScanState,
}

impl ScanExecution {
    pub fn is_failed(&self) -> bool {
        self.errors.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Raw,
    Normalized,
}

impl ReportKind {
    pub fn is_raw(self) -> bool {
        matches!(self, ReportKind::Raw)
    }
}

/// 原始报告或归一化报告（每个扫描每种至多一份）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub scan: ScanId,
    pub kind: ReportKind,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBatch {
    pub name: String,
    pub author: Option<String>,
    pub email: Option<String>,
    pub comments: Option<String>,
}

/// 一组一起提交的扫描
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub author: Option<String>,
    pub email: Option<String>,
    pub comments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_state_string_form_is_stable() {
        for state in [
            ScanState::Created,
            ScanState::Preparing,
            ScanState::Running,
            ScanState::FetchingOutput,
            ScanState::Normalizing,
            ScanState::Completed,
            ScanState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<ScanState>().unwrap(), state);
        }
        assert!("paused".parse::<ScanState>().is_err());
    }

    #[test]
    fn scan_request_defaults() {
        let req = ScanRequest::new("https://example.com/r.git");
        assert_eq!(req.commit, "main");
        assert_eq!(req.path, ".");
        assert_eq!(req.scanner, "scout");
        assert!(req.batch.is_none());
    }
}
