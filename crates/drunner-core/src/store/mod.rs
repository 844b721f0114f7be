//! 执行记录存储
//!
//! - `RecordStore` 是流水线与持久化层之间唯一的接口，读写都经由它完成。
//! - 输出行只追加；一次 `append_lines` 调用对应一次存储事务。
//! - `MemoryStore` 用于测试与临时运行，`SqliteStore` 用于持久化。
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::error::StoreError;
use crate::types::{
    Batch, BatchId, CommandSpec, Execution, ExecutionId, NewBatch, OutputLine, Report, ReportKind, ScanExecution,
    ScanId, ScanRequest, ScanState, Stream,
};

mod sqlite;

pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

pub trait RecordStore: Send + Sync {
    fn create_execution(&self, spec: &CommandSpec) -> StoreResult<Execution>;
    fn update_execution(&self, execution: &Execution) -> StoreResult<()>;
    fn execution(&self, id: ExecutionId) -> StoreResult<Execution>;
    fn executions(&self) -> StoreResult<Vec<Execution>>;
    /// 整批写入；实现需保证单个事务内完成
    fn append_lines(&self, lines: &[OutputLine]) -> StoreResult<()>;
    /// 按 (流, 序号) 排序返回
    fn output_lines(&self, id: ExecutionId) -> StoreResult<Vec<OutputLine>>;
    fn clear_output(&self, id: ExecutionId) -> StoreResult<()>;

    fn create_batch(&self, batch: &NewBatch) -> StoreResult<Batch>;
    fn batch(&self, id: BatchId) -> StoreResult<Batch>;
    fn batches(&self) -> StoreResult<Vec<Batch>>;

    fn create_scan(&self, request: &ScanRequest) -> StoreResult<ScanExecution>;
    fn update_scan(&self, scan: &ScanExecution) -> StoreResult<()>;
    fn scan(&self, id: ScanId) -> StoreResult<ScanExecution>;
    fn scans(&self) -> StoreResult<Vec<ScanExecution>>;
    fn batch_scans(&self, batch: BatchId) -> StoreResult<Vec<ScanExecution>>;

    /// 同一扫描同一种类的报告已存在时原地覆盖
    fn save_report(&self, scan: ScanId, kind: ReportKind, content: &str) -> StoreResult<()>;
    fn report(&self, scan: ScanId, kind: ReportKind) -> StoreResult<Option<Report>>;

    /// 标准输出按序拼接（以 `\n` 连接）
    fn stdout_text(&self, id: ExecutionId) -> StoreResult<String> {
        let lines = self.output_lines(id)?;
        let text: Vec<&str> = lines
            .iter()
            .filter(|l| l.stream == Stream::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        Ok(text.join("\n"))
    }
}

/// 进程内存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    executions: Vec<Execution>,
    lines: Vec<OutputLine>,
    batches: Vec<Batch>,
    scans: Vec<ScanExecution>,
    reports: Vec<Report>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn next_id(len: usize) -> i64 {
    len as i64 + 1
}

impl RecordStore for MemoryStore {
    fn create_execution(&self, spec: &CommandSpec) -> StoreResult<Execution> {
        let mut st = self.lock()?;
        let execution = Execution {
            id: ExecutionId(next_id(st.executions.len())),
            scan: spec.scan,
            kind: spec.kind.clone(),
            command: spec.command.clone(),
            workdir: spec.workdir.clone(),
            env: spec.env.clone(),
            started_at: None,
            duration_secs: None,
            ret: None,
        };
        st.executions.push(execution.clone());
        Ok(execution)
    }

    fn update_execution(&self, execution: &Execution) -> StoreResult<()> {
        let mut st = self.lock()?;
        let slot = st
            .executions
            .iter_mut()
            .find(|e| e.id == execution.id)
            .ok_or(StoreError::ExecutionNotFound(execution.id))?;
        *slot = execution.clone();
        Ok(())
    }

    fn execution(&self, id: ExecutionId) -> StoreResult<Execution> {
        let st = self.lock()?;
        st.executions.iter().find(|e| e.id == id).cloned().ok_or(StoreError::ExecutionNotFound(id))
    }

    fn executions(&self) -> StoreResult<Vec<Execution>> {
        Ok(self.lock()?.executions.clone())
    }

    fn append_lines(&self, lines: &[OutputLine]) -> StoreResult<()> {
        let mut st = self.lock()?;
        st.lines.extend_from_slice(lines);
        Ok(())
    }

    fn output_lines(&self, id: ExecutionId) -> StoreResult<Vec<OutputLine>> {
        let st = self.lock()?;
        let mut out: Vec<OutputLine> = st.lines.iter().filter(|l| l.execution == id).cloned().collect();
        out.sort_by_key(|l| (!l.stream.is_out(), l.idx));
        Ok(out)
    }

    fn clear_output(&self, id: ExecutionId) -> StoreResult<()> {
        self.lock()?.lines.retain(|l| l.execution != id);
        Ok(())
    }

    fn create_batch(&self, batch: &NewBatch) -> StoreResult<Batch> {
        let mut st = self.lock()?;
        let batch = Batch {
            id: BatchId(next_id(st.batches.len())),
            created_at: Utc::now(),
            name: batch.name.clone(),
            author: batch.author.clone(),
            email: batch.email.clone(),
            comments: batch.comments.clone(),
        };
        st.batches.push(batch.clone());
        Ok(batch)
    }

    fn batch(&self, id: BatchId) -> StoreResult<Batch> {
        let st = self.lock()?;
        st.batches.iter().find(|b| b.id == id).cloned().ok_or(StoreError::BatchNotFound(id))
    }

    fn batches(&self) -> StoreResult<Vec<Batch>> {
        Ok(self.lock()?.batches.clone())
    }

    fn create_scan(&self, request: &ScanRequest) -> StoreResult<ScanExecution> {
        let mut st = self.lock()?;
        let scan = ScanExecution {
            id: ScanId(next_id(st.scans.len())),
            batch: request.batch,
            created_at: Utc::now(),
            repo: request.repo.clone(),
            commit: request.commit.clone(),
            rev_hash: None,
            path: request.path.clone(),
            scanner: request.scanner.clone(),
            scanner_version: None,
            errors: None,
            state: ScanState::Created,
        };
        st.scans.push(scan.clone());
        Ok(scan)
    }

    fn update_scan(&self, scan: &ScanExecution) -> StoreResult<()> {
        let mut st = self.lock()?;
        let slot = st.scans.iter_mut().find(|s| s.id == scan.id).ok_or(StoreError::ScanNotFound(scan.id))?;
        *slot = scan.clone();
        Ok(())
    }

    fn scan(&self, id: ScanId) -> StoreResult<ScanExecution> {
        let st = self.lock()?;
        st.scans.iter().find(|s| s.id == id).cloned().ok_or(StoreError::ScanNotFound(id))
    }

    fn scans(&self) -> StoreResult<Vec<ScanExecution>> {
        Ok(self.lock()?.scans.clone())
    }

    fn batch_scans(&self, batch: BatchId) -> StoreResult<Vec<ScanExecution>> {
        let st = self.lock()?;
        Ok(st.scans.iter().filter(|s| s.batch == Some(batch)).cloned().collect())
    }

    fn save_report(&self, scan: ScanId, kind: ReportKind, content: &str) -> StoreResult<()> {
        let mut st = self.lock()?;
        match st.reports.iter_mut().find(|r| r.scan == scan && r.kind == kind) {
            Some(existing) => existing.content = content.to_string(),
            None => st.reports.push(Report { scan, kind, content: content.to_string() }),
        }
        Ok(())
    }

    fn report(&self, scan: ScanId, kind: ReportKind) -> StoreResult<Option<Report>> {
        let st = self.lock()?;
        Ok(st.reports.iter().find(|r| r.scan == scan && r.kind == kind).cloned())
    }
}
