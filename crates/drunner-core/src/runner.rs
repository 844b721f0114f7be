//! 扫描编排
//!
//! 状态机：Created → Preparing → Running → FetchingOutput → Normalizing → Completed，
//! 任一阶段出错（包括插件内 panic）都转入 Failed，错误链写入扫描记录。
//! 每次状态变化都立即落库；已完成的阶段不回滚。
use std::any::Any;
use std::borrow::Cow;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::error::{error_detail, RunnerError};
use crate::exec::ExecEngine;
use crate::findings::ResultsReport;
use crate::options::Settings;
use crate::registry::ScannerRegistry;
use crate::scanners::{ReportContext, RunContext, ScannerPlugin, OUTPUT_DIR, SOURCES_DIR};
use crate::shell::{quote, quote_path, sanitize};
use crate::store::RecordStore;
use crate::types::{CommandSpec, Execution, ReportKind, ScanExecution, ScanId, ScanRequest, ScanState};

pub struct Orchestrator<'a> {
    store: &'a dyn RecordStore,
    registry: &'a ScannerRegistry,
    engine: ExecEngine<'a>,
    settings: &'a Settings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn RecordStore, registry: &'a ScannerRegistry, settings: &'a Settings) -> Self {
        Self { store, registry, engine: ExecEngine::new(store, settings.exec.clone()), settings }
    }

    pub fn store(&self) -> &'a dyn RecordStore {
        self.store
    }

    pub fn engine(&self) -> &ExecEngine<'a> {
        &self.engine
    }

    /// 只登记，不运行
    pub fn submit(&self, request: &ScanRequest) -> Result<ScanExecution, RunnerError> {
        let scan = self.store.create_scan(request)?;
        info!(scan = %scan.id, repo = %scan.repo, commit = %scan.commit, scanner = %scan.scanner, "scan submitted");
        Ok(scan)
    }

    /// 运行到 Completed 或 Failed；失败时错误已记录在扫描记录上
    pub fn run(&self, id: ScanId) -> Result<ScanExecution, RunnerError> {
        let mut scan = self.store.scan(id)?;
        scan.errors = None;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_stages(&mut scan)));
        let err = match outcome {
            Ok(Ok(())) => {
                info!(scan = %scan.id, rev = ?scan.rev_hash, "scan completed");
                return Ok(scan);
            }
            Ok(Err(err)) => err,
            Err(payload) => RunnerError::Panicked(panic_message(payload.as_ref())),
        };

        let (err, detail) = error_detail(err);
        error!(scan = %scan.id, state = %scan.state, error = %detail, "scan failed");
        scan.errors = Some(detail);
        scan.state = ScanState::Failed;
        if let Err(store_err) = self.store.update_scan(&scan) {
            error!(scan = %scan.id, error = %store_err, "failed to record scan failure");
        }
        Err(err)
    }

    /// 用已存的原始报告重新归一化；没有原始报告时什么也不做
    pub fn rebuild(&self, id: ScanId) -> Result<Option<ResultsReport>, RunnerError> {
        let scan = self.store.scan(id)?;
        let Some(raw) = self.store.report(id, ReportKind::Raw)? else {
            debug!(scan = %id, "no raw report to rebuild from");
            return Ok(None);
        };
        let plugin = self.registry.get(&scan.scanner)?;
        let report = self.normalize(plugin.as_ref(), &scan, &raw.content)?;
        info!(scan = %id, findings = report.finding_count, "normalized report rebuilt");
        Ok(Some(report))
    }

    fn run_stages(&self, scan: &mut ScanExecution) -> Result<(), RunnerError> {
        let plugin = self.registry.get(&scan.scanner)?;
        let plugin = plugin.as_ref();

        self.set_state(scan, ScanState::Preparing)?;
        let workdir = self.make_workdir(&scan.scanner)?;
        self.prepare_sources(plugin, scan, workdir.path())?;

        self.set_state(scan, ScanState::Running)?;
        self.run_scanner(plugin, scan, workdir.path())?;

        self.set_state(scan, ScanState::FetchingOutput)?;
        let raw_path = workdir.path().join(plugin.raw_report_path());
        let raw = fs::read(&raw_path).map_err(|source| RunnerError::RawReport { path: raw_path.clone(), source })?;
        let raw = decode_report(scan.id, &raw);
        self.store.save_report(scan.id, ReportKind::Raw, &raw)?;

        self.set_state(scan, ScanState::Normalizing)?;
        let report = self.normalize(plugin, scan, &raw)?;
        debug!(scan = %scan.id, findings = report.finding_count, "normalized report stored");

        self.set_state(scan, ScanState::Completed)?;
        // 容器可能留下属主不同的文件，清理失败不影响结果
        if let Err(e) = workdir.close() {
            warn!(scan = %scan.id, error = %e, "failed to remove working directory");
        }
        Ok(())
    }

    fn set_state(&self, scan: &mut ScanExecution, state: ScanState) -> Result<(), RunnerError> {
        debug!(scan = %scan.id, from = %scan.state, to = %state, "scan state change");
        scan.state = state;
        self.store.update_scan(scan)?;
        Ok(())
    }

    fn make_workdir(&self, scanner: &str) -> Result<TempDir, RunnerError> {
        let prefix = format!("drunner-{}", sanitize(scanner));
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix("tmp");
        let dir = match &self.settings.work_dir {
            Some(base) => builder.tempdir_in(base),
            None => builder.tempdir(),
        }
        .map_err(RunnerError::Workdir)?;
        fs::create_dir(dir.path().join(OUTPUT_DIR)).map_err(RunnerError::Workdir)?;
        debug!(dir = %dir.path().display(), "working directory created");
        Ok(dir)
    }

    /// clone → checkout → rev-parse，依次执行
    fn prepare_sources(
        &self,
        plugin: &dyn ScannerPlugin,
        scan: &mut ScanExecution,
        workdir: &Path,
    ) -> Result<(), RunnerError> {
        let git = &self.settings.git;
        let srcs = workdir.join(SOURCES_DIR);

        let clone = format!("{git} clone {} {}", quote(&scan.repo), quote_path(&srcs));
        let ex = self.step(plugin, scan, "repo-clone", clone, workdir)?;
        if !ex.succeeded() {
            return Err(RunnerError::CloneFailed { repo: scan.repo.clone(), ret: ex.ret.unwrap_or(-1) });
        }

        let checkout = format!("{git} checkout {}", quote(&scan.commit));
        let ex = self.step(plugin, scan, "repo-checkout", checkout, &srcs)?;
        if !ex.succeeded() {
            return Err(RunnerError::CheckoutFailed {
                step: "checkout",
                commit: scan.commit.clone(),
                ret: ex.ret.unwrap_or(-1),
            });
        }

        let ex = self.step(plugin, scan, "rev-parse", format!("{git} rev-parse HEAD"), &srcs)?;
        if !ex.succeeded() {
            return Err(RunnerError::CheckoutFailed {
                step: "rev-parse",
                commit: scan.commit.clone(),
                ret: ex.ret.unwrap_or(-1),
            });
        }
        let rev = self.store.stdout_text(ex.id)?.trim().to_string();
        info!(scan = %scan.id, %rev, "sources checked out");
        scan.rev_hash = Some(rev);
        self.store.update_scan(scan)?;
        Ok(())
    }

    fn run_scanner(&self, plugin: &dyn ScannerPlugin, scan: &mut ScanExecution, workdir: &Path) -> Result<(), RunnerError> {
        let runtime = self.registry.runtime();
        if let Some(cmd) = plugin.version_command(runtime) {
            let ex = self.step(plugin, scan, "get-version", cmd, workdir)?;
            let version = self.store.stdout_text(ex.id)?.trim().to_string();
            if !ex.succeeded() || version.is_empty() {
                warn!(scan = %scan.id, ret = ?ex.ret, "could not determine scanner version");
            } else {
                info!(scan = %scan.id, %version, "scanner version");
                scan.scanner_version = Some(version);
                self.store.update_scan(scan)?;
            }
        }

        let ctx = RunContext {
            runtime,
            workdir,
            target: &scan.path,
            version: scan.scanner_version.as_deref(),
        };
        let cmd = plugin.run_command(&ctx);
        let ex = self.step(plugin, scan, "run-image", cmd, workdir)?;
        if !ex.succeeded() {
            // 扫描器发现问题时也可能以非零码退出，报告仍然可用
            warn!(scan = %scan.id, ret = ?ex.ret, "scanner exited with non-zero status");
        }
        Ok(())
    }

    fn step(
        &self,
        plugin: &dyn ScannerPlugin,
        scan: &ScanExecution,
        kind: &str,
        command: String,
        dir: &Path,
    ) -> Result<Execution, RunnerError> {
        let spec = CommandSpec::new(format!("{}-{kind}", plugin.name()), command).in_dir(dir).for_scan(scan.id);
        Ok(self.engine.exec(spec)?)
    }

    fn normalize(&self, plugin: &dyn ScannerPlugin, scan: &ScanExecution, raw: &str) -> Result<ResultsReport, RunnerError> {
        let normalized = plugin.parse(raw, &ReportContext::new(scan));
        let rejected = normalized.rejected().count();
        if rejected > 0 {
            warn!(scan = %scan.id, rejected, "some scanner output lines were skipped");
        }
        let json = normalized.report.to_json()?;
        self.store.save_report(scan.id, ReportKind::Normalized, &json)?;
        Ok(normalized.report)
    }
}

/// 非法 UTF-8 字节替换为 U+FFFD
fn decode_report(scan: ScanId, bytes: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        warn!(scan = %scan, bytes = bytes.len(), "raw report is not valid UTF-8, invalid bytes replaced");
    }
    text
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::Arc;

    use crate::findings::{Finding, ScannerName, Severity};
    use crate::scanners::{normalize_lines, Normalized, SkipReason};
    use crate::store::{MemoryStore, SqliteStore};

    /// 用 shell 命令代替容器的扫描器
    struct ShellScanner {
        name: &'static str,
        script: &'static str,
        panic_on_parse: bool,
    }

    impl ScannerPlugin for ShellScanner {
        fn name(&self) -> &str {
            self.name
        }

        fn image(&self) -> &str {
            "none"
        }

        fn raw_report_path(&self) -> &Path {
            Path::new("out/report.txt")
        }

        fn version_command(&self, _runtime: &str) -> Option<String> {
            Some("echo shellscan 1.2.3".to_string())
        }

        fn run_command(&self, ctx: &RunContext<'_>) -> String {
            format!("cd {} && {}", quote_path(ctx.workdir), self.script)
        }

        fn parse(&self, raw: &str, ctx: &ReportContext<'_>) -> Normalized {
            if self.panic_on_parse {
                panic!("parser blew up");
            }
            let scanner = ScannerName::new(self.name);
            let report = ResultsReport::for_scan(ctx.scan, &scanner);
            normalize_lines(raw, report, |line| {
                let (file, lineno) = line.split_once(':').ok_or_else(|| SkipReason::Malformed("no colon".into()))?;
                Ok(Finding {
                    name: "shell_finding".into(),
                    desc: String::new(),
                    category: "unknown".into(),
                    level: Severity::Low,
                    filename: file.into(),
                    lineno: lineno.parse().map_err(|_| SkipReason::Malformed("bad line number".into()))?,
                    jsonextra: serde_json::Value::Null,
                    scanner: scanner.clone(),
                })
            })
        }
    }

    fn registry_with(plugin: ShellScanner) -> ScannerRegistry {
        let mut registry = ScannerRegistry::with_defaults(&Settings::default());
        registry.register(Arc::new(plugin));
        registry
    }

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().map(|o| o.status.success()).unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(["-c", "user.name=drunner", "-c", "user.email=drunner@localhost"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?} failed");
        String::from_utf8(out.stdout).unwrap().trim().to_string()
    }

    /// 本地仓库，返回 (目录, HEAD 哈希)
    fn local_repo() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]);
        fs::write(dir.path().join("lib.rs"), "fn main() {}\n").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-q", "-m", "init"]);
        let head = git(dir.path(), &["rev-parse", "HEAD"]);
        (dir, head)
    }

    #[test]
    fn clone_of_missing_repo_fails_without_revision() {
        let store = MemoryStore::new();
        let settings = Settings::default();
        let registry = ScannerRegistry::with_defaults(&settings);
        let orch = Orchestrator::new(&store, &registry, &settings);

        let missing = tempfile::tempdir().unwrap();
        let repo = missing.path().join("does-not-exist");
        let scan = orch.submit(&ScanRequest::new(repo.to_string_lossy())).unwrap();
        let err = orch.run(scan.id).unwrap_err();
        assert!(matches!(err, RunnerError::CloneFailed { .. }), "{err:?}");

        let scan = store.scan(scan.id).unwrap();
        assert_eq!(scan.state, ScanState::Failed);
        assert!(scan.errors.as_deref().unwrap().contains("git clone failed"));
        assert!(scan.rev_hash.is_none());
        let kinds: Vec<_> = store.executions().unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["scout-repo-clone"]);
    }

    #[test]
    fn bad_commit_fails_checkout_without_revision() {
        if !git_available() {
            eprintln!("git not found, skipping");
            return;
        }
        let (repo, _head) = local_repo();
        let store = MemoryStore::new();
        let settings = Settings::default();
        let registry = ScannerRegistry::with_defaults(&settings);
        let orch = Orchestrator::new(&store, &registry, &settings);

        let request = ScanRequest::new(repo.path().to_string_lossy()).commit("no-such-ref");
        let scan = orch.submit(&request).unwrap();
        let err = orch.run(scan.id).unwrap_err();
        assert!(
            matches!(err, RunnerError::CheckoutFailed { step: "checkout", ref commit, .. } if commit == "no-such-ref"),
            "{err:?}"
        );

        let scan = store.scan(scan.id).unwrap();
        assert_eq!(scan.state, ScanState::Failed);
        assert!(scan.rev_hash.is_none());
        assert!(scan.errors.unwrap().starts_with("checkout failed for no-such-ref"));
        let kinds: Vec<_> = store.executions().unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec!["scout-repo-clone", "scout-repo-checkout"]);
    }

    #[test]
    fn invalid_utf8_report_is_replaced_not_rejected() {
        let decoded = decode_report(ScanId(1), b"a.rs:1\n\xffb.rs:2\n");
        assert!(matches!(decoded, Cow::Owned(_)));
        assert_eq!(decoded, "a.rs:1\n\u{FFFD}b.rs:2\n");

        let clean = decode_report(ScanId(1), b"a.rs:1\n");
        assert!(matches!(clean, Cow::Borrowed("a.rs:1\n")));
    }

    #[test]
    fn unknown_scanner_is_recorded_as_failure() {
        let store = MemoryStore::new();
        let settings = Settings::default();
        let registry = ScannerRegistry::with_defaults(&settings);
        let orch = Orchestrator::new(&store, &registry, &settings);

        let scan = orch.submit(&ScanRequest::new("https://example.invalid/repo.git").scanner("slither")).unwrap();
        assert!(matches!(orch.run(scan.id), Err(RunnerError::UnknownScanner { .. })));
        let scan = store.scan(scan.id).unwrap();
        assert_eq!(scan.state, ScanState::Failed);
        assert!(scan.errors.unwrap().contains("unknown scanner: slither"));
        assert!(store.executions().unwrap().is_empty());
    }

    #[test]
    fn full_pipeline_and_idempotent_rebuild() {
        if !git_available() {
            eprintln!("git not found, skipping");
            return;
        }
        let (repo, head) = local_repo();
        let store = SqliteStore::open_in_memory().unwrap();
        let settings = Settings::default();
        let registry = registry_with(ShellScanner {
            name: "shellscan",
            script: "printf 'a.rs:1\\nnot a finding\\nb.rs:22\\n' > out/report.txt",
            panic_on_parse: false,
        });
        let orch = Orchestrator::new(&store, &registry, &settings);

        let request = ScanRequest::new(repo.path().to_string_lossy()).commit(head.clone()).scanner("ShellScan");
        let scan = orch.submit(&request).unwrap();
        let done = orch.run(scan.id).unwrap();
        assert_eq!(done.state, ScanState::Completed);
        assert_eq!(done.rev_hash.as_deref(), Some(head.as_str()));
        assert_eq!(done.scanner_version.as_deref(), Some("shellscan 1.2.3"));
        assert!(done.errors.is_none());

        let raw = store.report(scan.id, ReportKind::Raw).unwrap().unwrap();
        assert_eq!(raw.content, "a.rs:1\nnot a finding\nb.rs:22\n");
        let stored = store.report(scan.id, ReportKind::Normalized).unwrap().unwrap();
        let report = ResultsReport::from_json(&stored.content).unwrap();
        assert_eq!(report.finding_count, 2);
        assert_eq!(report.findings[1].lineno, 22);

        let kinds: Vec<_> = store.executions().unwrap().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                "shellscan-repo-clone",
                "shellscan-repo-checkout",
                "shellscan-rev-parse",
                "shellscan-get-version",
                "shellscan-run-image",
            ]
        );

        orch.rebuild(scan.id).unwrap().unwrap();
        let again = store.report(scan.id, ReportKind::Normalized).unwrap().unwrap();
        assert_eq!(again.content, stored.content);
    }

    #[test]
    fn missing_raw_report_fails_after_revision_is_known() {
        if !git_available() {
            eprintln!("git not found, skipping");
            return;
        }
        let (repo, head) = local_repo();
        let store = MemoryStore::new();
        let settings = Settings::default();
        let registry = registry_with(ShellScanner { name: "shellscan", script: "exit 3", panic_on_parse: false });
        let orch = Orchestrator::new(&store, &registry, &settings);

        let request = ScanRequest::new(repo.path().to_string_lossy()).commit(head.clone()).scanner("shellscan");
        let scan = orch.submit(&request).unwrap();
        let err = orch.run(scan.id).unwrap_err();
        assert!(matches!(err, RunnerError::RawReport { .. }), "{err:?}");
        let scan = store.scan(scan.id).unwrap();
        assert_eq!(scan.state, ScanState::Failed);
        assert_eq!(scan.rev_hash.as_deref(), Some(head.as_str()));
        assert!(scan.errors.unwrap().contains("Caused by:"));
        assert!(orch.rebuild(scan.id).unwrap().is_none());
    }

    #[test]
    fn panicking_parser_is_caught() {
        if !git_available() {
            eprintln!("git not found, skipping");
            return;
        }
        let (repo, head) = local_repo();
        let store = MemoryStore::new();
        let settings = Settings::default();
        let registry = registry_with(ShellScanner {
            name: "shellscan",
            script: "echo x:1 > out/report.txt",
            panic_on_parse: true,
        });
        let orch = Orchestrator::new(&store, &registry, &settings);

        let scan = orch.submit(&ScanRequest::new(repo.path().to_string_lossy()).commit(head).scanner("shellscan")).unwrap();
        let err = orch.run(scan.id).unwrap_err();
        assert!(matches!(err, RunnerError::Panicked(ref msg) if msg == "parser blew up"));
        let scan = store.scan(scan.id).unwrap();
        assert_eq!(scan.state, ScanState::Failed);
        // 原始报告在归一化之前已经保存
        assert!(store.report(scan.id, ReportKind::Raw).unwrap().is_some());
        assert!(store.report(scan.id, ReportKind::Normalized).unwrap().is_none());
    }
}
