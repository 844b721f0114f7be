//! 自检扫描器：容器只负责跑通流程，报告内容固定
use std::path::{Path, PathBuf};

use serde_json::json;

use super::{DockerRun, Normalized, ReportContext, RunContext, ScannerPlugin, OUTPUT_DIR, SOURCES_DIR};
use crate::findings::{Finding, ResultsReport, ScannerName, Severity};
use crate::options::FixtureOptions;

const MOUNT: &str = "/scanme";

/// (名称, 分类, 级别, 文件)
const CANNED: [(&str, &str, Severity, &str); 4] = [
    ("vuln1 at x", "vuln1", Severity::Medium, "x.pas"),
    ("vuln9 at y", "vuln9", Severity::Low, "y.pas"),
    ("vuln5 at z", "vuln5", Severity::High, "x.pas"),
    ("vuln9 at t", "vuln9", Severity::Low, "x.pas"),
];
const CANNED_LINE: u64 = 75;

pub struct FixtureScanner {
    image: String,
    raw_report: PathBuf,
}

impl FixtureScanner {
    pub fn new(options: &FixtureOptions) -> Self {
        Self { image: options.image.clone(), raw_report: Path::new(OUTPUT_DIR).join("output.txt") }
    }
}

impl ScannerPlugin for FixtureScanner {
    fn name(&self) -> &str {
        "test"
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn raw_report_path(&self) -> &Path {
        &self.raw_report
    }

    fn version_command(&self, _runtime: &str) -> Option<String> {
        None
    }

    fn run_command(&self, ctx: &RunContext<'_>) -> String {
        let target = ctx.target.trim_start_matches('/');
        DockerRun::new(ctx.runtime, &self.image)
            .env("INPUT_TARGET", format!("{MOUNT}/{SOURCES_DIR}/{target}"))
            .env("OUTPUT_NAME", format!("{MOUNT}/{}", self.raw_report.display()))
            .mount(ctx.workdir, MOUNT)
            .to_command_line()
    }

    /// 原始内容不参与解析；扫描器名沿用任务里请求的名字
    fn parse(&self, _raw: &str, ctx: &ReportContext<'_>) -> Normalized {
        let scanner = ScannerName::new(ctx.scan.scanner.clone());
        let mut report = ResultsReport::for_scan(ctx.scan, &scanner);
        for (name, category, level, filename) in CANNED {
            report.add_finding(Finding {
                name: name.to_string(),
                desc: String::new(),
                category: category.to_string(),
                level,
                filename: filename.to_string(),
                lineno: CANNED_LINE,
                jsonextra: json!({}),
                scanner: scanner.clone(),
            });
        }
        Normalized::new(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanExecution, ScanId, ScanState};
    use chrono::Utc;

    #[test]
    fn canned_findings_use_requested_name() {
        let scan = ScanExecution {
            id: ScanId(3),
            batch: None,
            created_at: Utc::now(),
            repo: "git@github.com:tenuki/no-code.git".into(),
            commit: "main".into(),
            rev_hash: None,
            path: ".".into(),
            scanner: "mytest".into(),
            scanner_version: None,
            errors: None,
            state: ScanState::Normalizing,
        };
        let out = FixtureScanner::new(&FixtureOptions::default()).parse("anything", &ReportContext::new(&scan));
        assert_eq!(out.report.finding_count, 4);
        assert_eq!(out.report.scanners, vec![ScannerName::new("mytest")]);
        let tally = out.report.tally();
        assert_eq!((tally.high, tally.medium, tally.low), (1, 1, 2));
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn run_command_mounts_scanme() {
        let s = FixtureScanner::new(&FixtureOptions::default());
        let cmd = s.run_command(&RunContext {
            runtime: "podman",
            workdir: Path::new("/tmp/w"),
            target: ".",
            version: None,
        });
        assert_eq!(
            cmd,
            "podman run -i --rm -e INPUT_TARGET=/scanme/srcs/. -e OUTPUT_NAME=/scanme/out/output.txt \
             -v '/tmp/w:/scanme' 'drunner/testscan:latest'"
        );
        assert!(s.version_command("docker").is_none());
    }
}
