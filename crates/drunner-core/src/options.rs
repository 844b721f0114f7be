//! 运行配置（TOML 文件 + 环境变量覆盖）
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// 未显式指定时尝试读取的配置文件
pub const DEFAULT_CONFIG_PATH: &str = "./drunner.toml";

/// 顶层配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// SQLite 数据库文件
    pub database: PathBuf,
    /// 每个扫描任务私有工作目录的父目录；为空则使用系统临时目录
    pub work_dir: Option<PathBuf>,
    /// 容器运行时命令（docker / podman）
    pub container_runtime: String,
    pub git: String,
    pub exec: ExecOptions,
    pub scout: ScoutOptions,
    pub fixture: FixtureOptions,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: PathBuf::from("drunner.sqlite.db"),
            work_dir: None,
            container_runtime: "docker".to_string(),
            git: "git".to_string(),
            exec: ExecOptions::default(),
            scout: ScoutOptions::default(),
            fixture: FixtureOptions::default(),
        }
    }
}

impl Settings {
    /// 加载顺序：显式路径 → `DRUNNER_CONFIG` → `./drunner.toml`（存在时）→ 默认值；最后叠加环境变量
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os("DRUNNER_CONFIG").map(PathBuf::from))
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });

        let mut settings = match path {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_toml_str(&txt).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn from_toml_str(txt: &str) -> Result<Self> {
        Ok(toml::from_str(txt)?)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env::var_os("DRUNNER_DB") {
            self.database = PathBuf::from(v);
        }
        if let Some(v) = env::var_os("DRUNNER_WORK_DIR") {
            self.work_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("DRUNNER_RUNTIME") {
            self.container_runtime = v;
        }
    }
}

/// 进程执行引擎参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// 单次批量插入的最大行数
    pub batch_size: usize,
    /// 读线程与落库线程之间的队列容量（以批为单位）
    pub queue_capacity: usize,
    /// 队列满时，距上次入队超过该时长后改为阻塞入队（毫秒）
    pub debounce_ms: u64,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self { batch_size: 100, queue_capacity: 64, debounce_ms: 300 }
    }
}

impl ExecOptions {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoutOptions {
    pub image: String,
    /// 达到该版本起输出改为扁平的 rustc 诊断格式
    pub version_threshold: semver::Version,
    /// 规则代码 → 分类
    pub categories: BTreeMap<String, String>,
}

impl Default for ScoutOptions {
    fn default() -> Self {
        Self {
            image: "coinfabrik/scout:latest".to_string(),
            version_threshold: semver::Version::new(0, 2, 16),
            categories: BTreeMap::new(),
        }
    }
}

/// 自检用的内置扫描器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FixtureOptions {
    pub image: String,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self { image: "drunner/testscan:latest".to_string() }
    }
}
