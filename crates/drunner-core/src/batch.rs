//! 批次：任务行解析、并行派发、聚合报告与 CSV 导出
//!
//! 任务行格式为 `repo,commit,path,scanner`，后三列可省略或留空，
//! 分别取 `main` / `.` / `scout`。
use std::io::Write;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::error::{ExportError, RunnerError};
use crate::findings::ResultsReport;
use crate::runner::Orchestrator;
use crate::store::RecordStore;
use crate::types::{Batch, BatchId, NewBatch, ReportKind, ScanExecution, ScanId, ScanRequest, ScanState};

pub const CSV_HEADER: [&str; 6] = ["scanner", "repo", "path", "finding", "level", "location"];

/// 空行或仓库为空时返回 None
pub fn parse_task_line(line: &str) -> Option<ScanRequest> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut cols = line.splitn(4, ',').map(str::trim);
    let repo = cols.next().unwrap_or_default();
    if repo.is_empty() {
        return None;
    }
    let mut request = ScanRequest::new(repo);
    if let Some(commit) = cols.next().filter(|s| !s.is_empty()) {
        request = request.commit(commit);
    }
    if let Some(path) = cols.next().filter(|s| !s.is_empty()) {
        request = request.path(path);
    }
    if let Some(scanner) = cols.next().filter(|s| !s.is_empty()) {
        request = request.scanner(scanner);
    }
    Some(request)
}

pub fn parse_tasks(text: &str) -> Vec<ScanRequest> {
    text.lines().filter_map(parse_task_line).collect()
}

/// 登记批次及其全部扫描（不运行）
pub fn submit_batch(
    orch: &Orchestrator<'_>,
    batch: &NewBatch,
    requests: Vec<ScanRequest>,
) -> Result<(Batch, Vec<ScanExecution>), RunnerError> {
    let batch = orch.store().create_batch(batch)?;
    let mut scans = Vec::with_capacity(requests.len());
    for mut request in requests {
        request.batch = Some(batch.id);
        scans.push(orch.submit(&request)?);
    }
    info!(batch = %batch.id, name = %batch.name, scans = scans.len(), "batch submitted");
    Ok((batch, scans))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub scan: ScanId,
    pub state: ScanState,
}

/// 在独立的线程池上运行；单个扫描失败不影响其他扫描
///
/// `threads` 为 None 时等于 CPU 核心数。
pub fn run_batch(
    orch: &Orchestrator<'_>,
    scans: &[ScanId],
    threads: Option<usize>,
) -> Result<Vec<BatchOutcome>, RunnerError> {
    let threads = threads.unwrap_or_else(num_cpus::get).max(1);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(threads).build()?;
    info!(scans = scans.len(), threads, "running batch");
    let outcomes: Vec<BatchOutcome> = pool.install(|| {
        scans
            .par_iter()
            .map(|&scan| {
                let state = match orch.run(scan) {
                    Ok(done) => done.state,
                    Err(_) => ScanState::Failed,
                };
                BatchOutcome { scan, state }
            })
            .collect()
    });
    let failed = outcomes.iter().filter(|o| o.state == ScanState::Failed).count();
    if failed > 0 {
        warn!(total = outcomes.len(), failed, "batch finished with failures");
    } else {
        info!(total = outcomes.len(), "batch finished");
    }
    Ok(outcomes)
}

/// 批次内每个扫描的归一化报告；尚未生成报告的扫描跳过
fn normalized_reports(
    store: &dyn RecordStore,
    batch: BatchId,
) -> Result<Vec<(ScanExecution, ResultsReport)>, ExportError> {
    let mut out = Vec::new();
    for scan in store.batch_scans(batch)? {
        if let Some(report) = store.report(scan.id, ReportKind::Normalized)? {
            let parsed = ResultsReport::from_json(&report.content)?;
            out.push((scan, parsed));
        }
    }
    Ok(out)
}

pub fn composite_report(store: &dyn RecordStore, batch: BatchId) -> Result<ResultsReport, ExportError> {
    let info = store.batch(batch)?;
    let mut composite = ResultsReport::new(format!("Composite report for batch {}", info.name), info.created_at, true);
    composite.issuer = info.author.clone();
    for (_, report) in normalized_reports(store, batch)? {
        for scanner in &report.scanners {
            composite.add_scanner(scanner);
        }
        for finding in report.findings {
            composite.add_finding(finding);
        }
    }
    Ok(composite)
}

/// 每个 (扫描, 发现) 一行；返回写入的数据行数
pub fn write_composite_csv<W: Write>(store: &dyn RecordStore, batch: BatchId, out: W) -> Result<usize, ExportError> {
    let mut wtr = csv::Writer::from_writer(out);
    wtr.write_record(CSV_HEADER)?;
    let mut rows = 0;
    for (scan, report) in normalized_reports(store, batch)? {
        for finding in &report.findings {
            let location = format!("{}:{}", finding.filename, finding.lineno);
            wtr.write_record([
                scan.scanner.as_str(),
                scan.repo.as_str(),
                scan.path.as_str(),
                finding.name.as_str(),
                finding.level.as_str(),
                location.as_str(),
            ])?;
            rows += 1;
        }
    }
    wtr.flush()?;
    Ok(rows)
}
