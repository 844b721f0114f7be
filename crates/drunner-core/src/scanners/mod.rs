//! 扫描器插件约定
//!
//! 每个扫描器只需回答两件事：容器里怎么跑、原始输出怎么转成 Finding。
//! 构建/更新镜像的命令由默认实现给出，可按需覆盖。
use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use crate::findings::{Finding, ResultsReport};
use crate::shell::{quote, quote_path};
use crate::types::ScanExecution;

mod fixture;
mod scout;

pub use fixture::FixtureScanner;
pub use scout::ScoutScanner;

/// 工作目录中存放输出的子目录
pub const OUTPUT_DIR: &str = "out";
/// 工作目录中存放源码的子目录
pub const SOURCES_DIR: &str = "srcs";

/// 运行容器所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub runtime: &'a str,
    /// 任务私有工作目录（挂载进容器）
    pub workdir: &'a Path,
    /// 仓库内的相对扫描路径
    pub target: &'a str,
    pub version: Option<&'a str>,
}

/// 归一化所需的上下文
#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub scan: &'a ScanExecution,
}

impl<'a> ReportContext<'a> {
    pub fn new(scan: &'a ScanExecution) -> Self {
        Self { scan }
    }

    pub fn version(&self) -> Option<&'a str> {
        self.scan.scanner_version.as_deref()
    }
}

pub trait ScannerPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn image(&self) -> &str;

    /// 原始报告相对于工作目录的路径
    fn raw_report_path(&self) -> &Path;

    /// 获取工具版本的命令；不支持时返回 None
    fn version_command(&self, runtime: &str) -> Option<String>;

    fn run_command(&self, ctx: &RunContext<'_>) -> String;

    fn parse(&self, raw: &str, ctx: &ReportContext<'_>) -> Normalized;

    fn build_command(&self, runtime: &str) -> String {
        format!("{runtime} build -t {} .", quote(self.image()))
    }

    fn update_command(&self, runtime: &str) -> String {
        format!("{runtime} pull {}", quote(self.image()))
    }
}

/// 单行被跳过的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// 不是合法记录或缺少必需字段
    Malformed(String),
    /// 合法但与问题无关（构建进度、无规则代码的诊断等）
    Irrelevant,
    UnknownSeverity(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Malformed(why) => write!(f, "malformed line: {why}"),
            SkipReason::Irrelevant => f.write_str("not a finding"),
            SkipReason::UnknownSeverity(level) => write!(f, "unknown severity {level:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiagnostic {
    /// 从 1 开始的行号
    pub line_no: usize,
    pub reason: SkipReason,
    pub excerpt: String,
}

impl LineDiagnostic {
    pub fn is_irrelevant(&self) -> bool {
        self.reason == SkipReason::Irrelevant
    }
}

/// 归一化结果：报告 + 被跳过行的诊断
#[derive(Debug, Clone)]
pub struct Normalized {
    pub report: ResultsReport,
    pub diagnostics: Vec<LineDiagnostic>,
}

impl Normalized {
    pub fn new(report: ResultsReport) -> Self {
        Self { report, diagnostics: Vec::new() }
    }

    /// 不包括无关行
    pub fn rejected(&self) -> impl Iterator<Item = &LineDiagnostic> {
        self.diagnostics.iter().filter(|d| !d.is_irrelevant())
    }
}

const EXCERPT_CHARS: usize = 120;

/// 逐行解析：成功的行各产出一条 Finding，失败的行记录诊断后跳过，绝不整体失败
pub fn normalize_lines<F>(raw: &str, report: ResultsReport, mut parse_line: F) -> Normalized
where
    F: FnMut(&str) -> Result<Finding, SkipReason>,
{
    let mut out = Normalized::new(report);
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(finding) => out.report.add_finding(finding),
            Err(reason) => {
                let excerpt: String = line.chars().take(EXCERPT_CHARS).collect();
                if reason == SkipReason::Irrelevant {
                    debug!(line_no = i + 1, "skipping non-finding line");
                } else {
                    warn!(line_no = i + 1, %reason, line = %excerpt, "invalid line in scanner output, ignoring");
                }
                out.diagnostics.push(LineDiagnostic { line_no: i + 1, reason, excerpt });
            }
        }
    }
    out
}

/// `<runtime> run -i --rm -e K=V ... -v host:container image`
#[derive(Debug, Clone)]
pub struct DockerRun {
    runtime: String,
    image: String,
    env: Vec<(String, String)>,
    mounts: Vec<String>,
}

impl DockerRun {
    pub fn new(runtime: &str, image: &str) -> Self {
        Self { runtime: runtime.to_string(), image: image.to_string(), env: Vec::new(), mounts: Vec::new() }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn mount(mut self, host: &Path, container: &str) -> Self {
        self.mounts.push(format!("{}:{container}", host.display()));
        self
    }

    pub fn to_command_line(&self) -> String {
        let mut parts = vec![self.runtime.clone(), "run".into(), "-i".into(), "--rm".into()];
        for (key, value) in &self.env {
            parts.push("-e".into());
            parts.push(quote(&format!("{key}={value}")));
        }
        for mount in &self.mounts {
            parts.push("-v".into());
            parts.push(quote_path(Path::new(mount)));
        }
        parts.push(quote(&self.image));
        parts.join(" ")
    }
}
