//! Scout 静态分析器
//!
//! 输出为每行一个 JSON 对象。0.2.16 之前是 cargo 消息信封
//! （`reason` / `target` / `message`），之后是扁平的 rustc 诊断。
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    normalize_lines, DockerRun, Normalized, ReportContext, RunContext, ScannerPlugin, SkipReason,
    OUTPUT_DIR, SOURCES_DIR,
};
use crate::findings::{Finding, ResultsReport, ScannerName, Severity};
use crate::options::ScoutOptions;
use crate::version::{OutputLayout, VersionGate};

const NAME: &str = "scout";
const MOUNT: &str = "/scoutme";
const UNKNOWN_CATEGORY: &str = "unknown";

/// 旧格式的外层信封
#[derive(Debug, Deserialize)]
struct CargoMessage {
    reason: String,
    #[serde(default)]
    manifest_path: Option<String>,
    #[serde(default)]
    target: Option<CargoTarget>,
    #[serde(default)]
    message: Option<Diagnostic>,
}

#[derive(Debug, Deserialize)]
struct CargoTarget {
    src_path: String,
}

#[derive(Debug, Deserialize)]
struct Diagnostic {
    message: String,
    #[serde(default)]
    code: Option<DiagnosticCode>,
    level: String,
    #[serde(default)]
    spans: Vec<Value>,
    #[serde(rename = "crate", default)]
    crate_name: Option<String>,
    #[serde(rename = "$message_type", default)]
    message_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiagnosticCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct Span {
    file_name: String,
    line_start: u64,
    #[serde(default)]
    is_primary: bool,
}

pub struct ScoutScanner {
    image: String,
    gate: VersionGate,
    categories: BTreeMap<String, String>,
    raw_report: PathBuf,
}

impl ScoutScanner {
    pub fn new(options: &ScoutOptions) -> Self {
        Self {
            image: options.image.clone(),
            gate: VersionGate::new(options.version_threshold.clone()),
            categories: options.categories.clone(),
            raw_report: Path::new(OUTPUT_DIR).join("report.json"),
        }
    }

    fn category(&self, code: &str) -> String {
        self.categories.get(code).cloned().unwrap_or_else(|| UNKNOWN_CATEGORY.to_string())
    }

    fn parse_line(&self, line: &str, layout: OutputLayout) -> Result<Finding, SkipReason> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| SkipReason::Malformed(e.to_string()))?;
        match layout {
            OutputLayout::Legacy => {
                let msg: CargoMessage =
                    serde_json::from_value(value).map_err(|e| SkipReason::Malformed(e.to_string()))?;
                if msg.reason != "compiler-message" {
                    return Err(SkipReason::Irrelevant);
                }
                let diag = msg.message.ok_or(SkipReason::Irrelevant)?;
                let target = msg
                    .target
                    .ok_or_else(|| SkipReason::Malformed("missing target".to_string()))?;
                self.finding(diag, Some(target.src_path), msg.manifest_path)
            }
            OutputLayout::Flattened => {
                let diag: Diagnostic =
                    serde_json::from_value(value).map_err(|e| SkipReason::Malformed(e.to_string()))?;
                if diag.message_type.as_deref().is_some_and(|t| t != "diagnostic") {
                    return Err(SkipReason::Irrelevant);
                }
                self.finding(diag, None, None)
            }
        }
    }

    /// `src_path` 为空时取主 span 的文件名
    fn finding(
        &self,
        diag: Diagnostic,
        src_path: Option<String>,
        manifest: Option<String>,
    ) -> Result<Finding, SkipReason> {
        // 没有规则代码的诊断来自编译器本身
        let code = diag.code.ok_or(SkipReason::Irrelevant)?.code;
        let level = Severity::parse(&diag.level)
            .ok_or_else(|| SkipReason::UnknownSeverity(diag.level.clone()))?;
        let primary = primary_span(&diag.spans)?;

        Ok(Finding {
            category: self.category(&code),
            name: code,
            desc: diag.message,
            level,
            filename: src_path.unwrap_or_else(|| primary.file_name.clone()),
            lineno: primary.line_start,
            jsonextra: json!({
                "spans": diag.spans,
                "extra": {
                    "filename": primary.file_name,
                    "manifest": manifest,
                    "crate": diag.crate_name,
                },
            }),
            scanner: ScannerName::new(NAME),
        })
    }
}

fn primary_span(spans: &[Value]) -> Result<Span, SkipReason> {
    let parsed = spans
        .iter()
        .map(|v| Span::deserialize(v).map_err(|e| SkipReason::Malformed(format!("bad span: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;
    let idx = parsed.iter().position(|s| s.is_primary).unwrap_or(0);
    parsed
        .into_iter()
        .nth(idx)
        .ok_or_else(|| SkipReason::Malformed("diagnostic without spans".to_string()))
}

fn output_format(layout: OutputLayout) -> &'static str {
    match layout {
        OutputLayout::Legacy => "json",
        OutputLayout::Flattened => "raw-json",
    }
}

impl ScannerPlugin for ScoutScanner {
    fn name(&self) -> &str {
        NAME
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn raw_report_path(&self) -> &Path {
        &self.raw_report
    }

    fn version_command(&self, runtime: &str) -> Option<String> {
        Some(DockerRun::new(runtime, &self.image).env("INPUT_SCOUT_ARGS", "--version").to_command_line())
    }

    fn run_command(&self, ctx: &RunContext<'_>) -> String {
        let format = output_format(self.gate.layout_for_str(ctx.version));
        let target = ctx.target.trim_start_matches('/');
        DockerRun::new(ctx.runtime, &self.image)
            .env("INPUT_TARGET", format!("{MOUNT}/{SOURCES_DIR}/{target}"))
            .env("RUST_BACKTRACE", "full")
            .env(
                "INPUT_SCOUT_ARGS",
                format!(" --output-format {format} --output-path {MOUNT}/{}", self.raw_report.display()),
            )
            .env("CARGO_TARGET_DIR", "/tmp")
            .mount(ctx.workdir, MOUNT)
            .to_command_line()
    }

    fn parse(&self, raw: &str, ctx: &ReportContext<'_>) -> Normalized {
        let layout = self.gate.layout_for_str(ctx.version());
        let report = ResultsReport::for_scan(ctx.scan, &ScannerName::new(NAME));
        normalize_lines(raw, report, |line| self.parse_line(line, layout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanExecution, ScanId, ScanState};
    use chrono::{TimeZone, Utc};

    fn scan(version: Option<&str>) -> ScanExecution {
        ScanExecution {
            id: ScanId(1),
            batch: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            repo: "https://github.com/CoinFabrik/scout-soroban-examples".into(),
            commit: "main".into(),
            rev_hash: None,
            path: ".".into(),
            scanner: "scout".into(),
            scanner_version: version.map(str::to_string),
            errors: None,
            state: ScanState::Normalizing,
        }
    }

    fn span(file: &str, line: u64) -> Value {
        json!({
            "byte_end": 433, "byte_start": 413, "column_end": 29, "column_start": 9,
            "expansion": null, "file_name": file, "is_primary": true, "label": null,
            "line_end": line, "line_start": line,
            "suggested_replacement": null, "suggestion_applicability": null, "text": []
        })
    }

    fn legacy_line(code: &str, level: &str) -> String {
        json!({
            "reason": "compiler-message",
            "package_id": "avoid-core-mem-forget-vulnerable-1 0.1.0",
            "manifest_path": "/scoutme/srcs/vulnerable-example/Cargo.toml",
            "target": {
                "kind": ["cdylib"],
                "name": "avoid-core-mem-forget-vulnerable-1",
                "src_path": "/scoutme/srcs/vulnerable-example/src/lib.rs"
            },
            "message": {
                "$message_type": "diagnostic",
                "children": [],
                "code": {"code": code, "explanation": null},
                "level": level,
                "message": "Use the latest version of Soroban",
                "spans": [span("vulnerable-example/src/lib.rs", 1)]
            }
        })
        .to_string()
    }

    fn flat_line(code: &str, line: u64) -> String {
        json!({
            "$message_type": "diagnostic",
            "children": [],
            "code": {"code": code, "explanation": null},
            "crate": "avoid_core_mem_forget_vulnerable_1",
            "level": "warning",
            "message": "Use the `let _ = ...` pattern or `.drop()` method to forget the value",
            "spans": [span("vulnerable-example/src/lib.rs", line)]
        })
        .to_string()
    }

    fn scanner() -> ScoutScanner {
        let mut options = ScoutOptions::default();
        options.categories.insert("avoid_core_mem_forget".into(), "Best practices".into());
        ScoutScanner::new(&options)
    }

    #[test]
    fn legacy_layout_reads_nested_target() {
        let scan = scan(Some("cargo-scout-audit 0.2.10"));
        let out = scanner().parse(&legacy_line("soroban_version", "warning"), &ReportContext::new(&scan));
        assert_eq!(out.report.finding_count, 1);
        let f = &out.report.findings[0];
        assert_eq!(f.name, "soroban_version");
        assert_eq!(f.level, Severity::Medium);
        assert_eq!(f.filename, "/scoutme/srcs/vulnerable-example/src/lib.rs");
        assert_eq!(f.lineno, 1);
        assert_eq!(f.category, "unknown");
        assert_eq!(f.jsonextra["extra"]["manifest"], "/scoutme/srcs/vulnerable-example/Cargo.toml");
        assert_eq!(f.jsonextra["extra"]["filename"], "vulnerable-example/src/lib.rs");
        assert_eq!(f.jsonextra["spans"][0]["column_start"], 9);
    }

    #[test]
    fn flattened_layout_reads_top_level() {
        let scan = scan(Some("0.2.20"));
        let out = scanner().parse(&flat_line("avoid_core_mem_forget", 23), &ReportContext::new(&scan));
        assert_eq!(out.report.finding_count, 1);
        let f = &out.report.findings[0];
        assert_eq!(f.name, "avoid_core_mem_forget");
        assert_eq!(f.category, "Best practices");
        assert_eq!(f.filename, "vulnerable-example/src/lib.rs");
        assert_eq!(f.lineno, 23);
        assert_eq!(f.jsonextra["extra"]["crate"], "avoid_core_mem_forget_vulnerable_1");
        assert!(f.jsonextra["extra"]["manifest"].is_null());
    }

    #[test]
    fn version_picks_layout() {
        let s = scanner();
        // 旧格式的行在新版本下不是合法的扁平诊断
        let newer = scan(Some("0.2.20"));
        let out = s.parse(&legacy_line("soroban_version", "warning"), &ReportContext::new(&newer));
        assert_eq!(out.report.finding_count, 0);
        assert_eq!(out.rejected().count(), 1);

        let older = scan(Some("0.2.10"));
        let out = s.parse(&flat_line("avoid_core_mem_forget", 23), &ReportContext::new(&older));
        assert_eq!(out.report.finding_count, 0);
    }

    #[test]
    fn three_good_one_malformed() {
        let raw = [
            flat_line("avoid_core_mem_forget", 23),
            flat_line("unsafe_unwrap", 40),
            "{\"level\": \"warning\", \"spans\": [".to_string(),
            flat_line("divide_by_zero", 7),
        ]
        .join("\n");
        let scan = scan(Some("0.2.20"));
        let out = scanner().parse(&raw, &ReportContext::new(&scan));
        assert_eq!(out.report.finding_count, 3);
        assert_eq!(out.report.scanners, vec![ScannerName::new("scout")]);
        let rejected: Vec<_> = out.rejected().collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].line_no, 3);
        assert!(matches!(rejected[0].reason, SkipReason::Malformed(_)));
    }

    #[test]
    fn irrelevant_and_unknown_severity_lines() {
        let build_progress = json!({"reason": "build-finished", "success": true}).to_string();
        let no_code = json!({
            "reason": "compiler-message",
            "target": {"src_path": "src/lib.rs"},
            "message": {"code": null, "level": "warning", "message": "unused", "spans": [span("src/lib.rs", 3)]}
        })
        .to_string();
        let raw = [build_progress, no_code, legacy_line("soroban_version", "catastrophic")].join("\n");
        let scan = scan(Some("0.2.10"));
        let out = scanner().parse(&raw, &ReportContext::new(&scan));
        assert_eq!(out.report.finding_count, 0);
        assert_eq!(out.diagnostics.len(), 3);
        assert_eq!(out.diagnostics[0].reason, SkipReason::Irrelevant);
        assert_eq!(out.diagnostics[1].reason, SkipReason::Irrelevant);
        assert_eq!(out.diagnostics[2].reason, SkipReason::UnknownSeverity("catastrophic".into()));
    }

    #[test]
    fn run_command_uses_layout_format() {
        let s = scanner();
        let ctx = RunContext {
            runtime: "docker",
            workdir: Path::new("/tmp/drunner-scoutX1tmp"),
            target: "vesting/",
            version: Some("0.2.10"),
        };
        let cmd = s.run_command(&ctx);
        assert!(cmd.starts_with("docker run -i --rm "));
        assert!(cmd.contains("INPUT_TARGET=/scoutme/srcs/vesting/"));
        assert!(cmd.contains("'INPUT_SCOUT_ARGS= --output-format json --output-path /scoutme/out/report.json'"));
        assert!(cmd.contains("-v '/tmp/drunner-scoutX1tmp:/scoutme'"));

        let cmd = s.run_command(&RunContext { version: None, ..ctx });
        assert!(cmd.contains("--output-format raw-json"));
    }

    #[test]
    fn report_name_comes_from_scan() {
        let scan = scan(None);
        let out = scanner().parse("", &ReportContext::new(&scan));
        assert_eq!(
            out.report.name,
            "Single scout execution on https://github.com/CoinFabrik/scout-soroban-examples@main."
        );
        assert_eq!(out.report.date, scan.created_at);
        assert_eq!(out.report.finding_count, 0);
    }
}
