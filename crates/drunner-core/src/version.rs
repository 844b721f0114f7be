//! 扫描器版本解析与输出格式门控
//!
//! 统一使用 semver 排序；中间的补丁版本自动继承最近的已知格式。
use semver::Version;

/// 扫描器原始输出的字段布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// cargo 消息信封：诊断位于 `message`，源文件位于 `target.src_path`
    Legacy,
    /// 扁平的 rustc 诊断：字段都在顶层
    Flattened,
}

/// 宽松解析工具输出的版本串
///
/// 取最后一个空白分隔的片段（兼容 `cargo-scout-audit 0.2.10`），
/// 去掉 `v` 前缀，缺失的 minor/patch 以 0 补齐。
pub fn parse_tool_version(raw: &str) -> Option<Version> {
    let token = raw.split_whitespace().last()?;
    let token = token.trim_start_matches(['v', 'V']);
    if let Ok(v) = Version::parse(token) {
        return Some(v);
    }

    let core = token.split(['-', '+']).next()?;
    let mut parts = core
        .split('.')
        .map(|p| p.parse::<u64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    parts.resize(3, 0);
    Some(Version::new(parts[0], parts[1], parts[2]))
}

/// 版本门：低于阈值走旧格式，达到或超过阈值走新格式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionGate {
    threshold: Version,
}

impl VersionGate {
    pub fn new(threshold: Version) -> Self {
        Self { threshold }
    }

    pub fn layout_for(&self, version: Option<&Version>) -> OutputLayout {
        match version {
            Some(v) if *v < self.threshold => OutputLayout::Legacy,
            // 未知版本按当前格式处理
            _ => OutputLayout::Flattened,
        }
    }

    pub fn layout_for_str(&self, version: Option<&str>) -> OutputLayout {
        self.layout_for(version.and_then(parse_tool_version).as_ref())
    }
}
