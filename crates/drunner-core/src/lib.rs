//! 容器化扫描任务的执行与结果归一化
//!
//! 设计要点：
//! - 所有外部命令都经由 `ExecEngine` 执行，stdout/stderr 并发读取、分批落库。
//! - `Orchestrator` 驱动单个扫描任务的状态机，任何失败都记录在扫描记录上。
//! - 扫描器以插件形式注册；原始输出逐行解析，坏行跳过而不是整体失败。
//! - 存储只通过 `RecordStore` 访问，SQLite 为默认实现。

mod batch;
mod error;
mod exec;
mod findings;
mod options;
mod registry;
mod runner;
pub mod scanners;
mod shell;
pub mod store;
mod types;
pub mod version;

pub use batch::{
    composite_report, parse_task_line, parse_tasks, run_batch, submit_batch, write_composite_csv, BatchOutcome,
    CSV_HEADER,
};
pub use error::{error_detail, ExecError, ExportError, RunnerError, StoreError};
pub use exec::ExecEngine;
pub use findings::{Finding, ResultsReport, ScannerName, Severity, SeverityTally, UnknownSeverity};
pub use options::{ExecOptions, FixtureOptions, ScoutOptions, Settings, DEFAULT_CONFIG_PATH};
pub use registry::ScannerRegistry;
pub use runner::Orchestrator;
pub use scanners::{Normalized, ScannerPlugin};
pub use store::{MemoryStore, RecordStore, SqliteStore};
pub use types::{
    Batch, BatchId, CommandSpec, Execution, ExecutionId, NewBatch, OutputLine, Report, ReportKind, ScanExecution,
    ScanId, ScanRequest, ScanState, Stream,
};
