//! 统一的结果模型：Finding / ResultsReport / Severity
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ScanExecution;

/// 严重级别（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    High,
    Medium,
    Low,
    Enhancement,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
            Severity::Enhancement => "Enhancement",
        }
    }

    /// 大小写不敏感；同时接受编译器诊断的级别名作为同义词
    pub fn parse(s: &str) -> Option<Severity> {
        let s = s.trim().to_ascii_lowercase();
        let sev = match s.as_str() {
            "high" | "error" => Severity::High,
            "medium" | "warning" => Severity::Medium,
            "low" | "note" => Severity::Low,
            "enhancement" | "help" => Severity::Enhancement,
            _ => return None,
        };
        Some(sev)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity: {0:?}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse(s).ok_or_else(|| UnknownSeverity(s.to_string()))
    }
}

/// 扫描器名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScannerName(pub String);

impl ScannerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScannerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单条归一化问题；产出后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// 简短名称/规则代码
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub category: String,
    pub level: Severity,
    pub filename: String,
    pub lineno: u64,
    /// 工具相关的上下文（位置信息等），原样透传
    #[serde(default)]
    pub jsonextra: serde_json::Value,
    pub scanner: ScannerName,
}

/// 归一化报告
///
/// 序列化形状：`{name, date, issuer, scanners, finding_count, findings}`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsReport {
    pub name: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub issuer: Option<String>,
    /// 单次扫描为 false，批次聚合为 true；不进入文档
    #[serde(skip_serializing, default)]
    pub composite: bool,
    #[serde(default)]
    pub scanners: Vec<ScannerName>,
    #[serde(default)]
    pub finding_count: usize,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ResultsReport {
    pub fn new(name: impl Into<String>, date: DateTime<Utc>, composite: bool) -> Self {
        Self {
            name: name.into(),
            date,
            issuer: None,
            composite,
            scanners: Vec::new(),
            finding_count: 0,
            findings: Vec::new(),
        }
    }

    /// 单次扫描报告；名称和日期都取自扫描记录，重复生成结果一致
    pub fn for_scan(scan: &ScanExecution, scanner: &ScannerName) -> Self {
        let mut report = Self::new(
            format!("Single {} execution on {}@{}.", scan.scanner, scan.repo, scan.commit),
            scan.created_at,
            false,
        );
        report.add_scanner(scanner);
        report
    }

    pub fn add_scanner(&mut self, scanner: &ScannerName) {
        if !self.scanners.contains(scanner) {
            self.scanners.push(scanner.clone());
        }
    }

    pub fn add_finding(&mut self, finding: Finding) {
        self.add_scanner(&finding.scanner);
        self.findings.push(finding);
        self.finding_count = self.findings.len();
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn tally(&self) -> SeverityTally {
        SeverityTally::from_findings(&self.findings)
    }
}

/// 按级别计数，并给出加权分数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityTally {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub enhancement: usize,
}

impl SeverityTally {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut tally = Self::default();
        for f in findings {
            tally.add(f.level);
        }
        tally
    }

    pub fn add(&mut self, level: Severity) {
        match level {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Enhancement => self.enhancement += 1,
        }
    }

    pub fn get(&self, level: Severity) -> usize {
        match level {
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Enhancement => self.enhancement,
        }
    }

    /// High 记 1，Medium 记 1/2，Low 记 1/4，Enhancement 记 1/10
    pub fn score(&self) -> f64 {
        self.high as f64 + self.medium as f64 / 2.0 + self.low as f64 / 4.0 + self.enhancement as f64 / 10.0
    }
}
