//! 错误类型
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::{BatchId, ExecutionId, ScanId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode record field")]
    Json(#[from] serde_json::Error),

    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("scan {0} not found")]
    ScanNotFound(ScanId),

    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("record store lock poisoned")]
    Poisoned,
}

/// 进程执行引擎的错误；非零退出码不属于错误
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for `{command}`")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare replay directory")]
    Workdir(#[source] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 扫描流水线的阶段性错误；由顶层处理统一转成 Failed
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("git clone failed for {repo} (exit code {ret})")]
    CloneFailed { repo: String, ret: i32 },

    #[error("{step} failed for {commit} (exit code {ret})")]
    CheckoutFailed {
        step: &'static str,
        commit: String,
        ret: i32,
    },

    #[error("unknown scanner: {name} (registered: {registered})")]
    UnknownScanner { name: String, registered: String },

    #[error("failed to prepare working directory")]
    Workdir(#[source] io::Error),

    #[error("failed to read raw report {}", path.display())]
    RawReport {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to serialize normalized report")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to build worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("scanner panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stored normalized report is not valid JSON")]
    Json(#[from] serde_json::Error),

    #[error("failed to write csv")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 展开完整的错误链（anyhow 的 `{:?}` 格式），写入扫描记录的 errors 字段；原错误原样交还
pub fn error_detail(err: RunnerError) -> (RunnerError, String) {
    let report = anyhow::Error::new(err);
    let detail = format!("{report:?}");
    match report.downcast::<RunnerError>() {
        Ok(err) => (err, detail),
        Err(other) => (RunnerError::Panicked(other.to_string()), detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_includes_source_chain() {
        let err = RunnerError::RawReport {
            path: PathBuf::from("/tmp/x/out/report.json"),
            source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        };
        let (err, detail) = error_detail(err);
        assert!(detail.starts_with("failed to read raw report /tmp/x/out/report.json\n\nCaused by:"));
        assert!(detail.contains("\n    No such file or directory"));
        assert!(matches!(err, RunnerError::RawReport { .. }));
    }

    #[test]
    fn detail_without_source_is_single_line() {
        let err = RunnerError::CloneFailed { repo: "r".into(), ret: 128 };
        let (err, detail) = error_detail(err);
        assert!(detail.starts_with("git clone failed for r (exit code 128)"));
        assert!(!detail.contains("Caused by:"));
        assert!(matches!(err, RunnerError::CloneFailed { ret: 128, .. }));
    }
}
