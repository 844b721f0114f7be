//! 扫描器注册表
//!
//! 启动时构建一次，之后按引用传递；不存在全局可变状态。
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::{ExecError, RunnerError};
use crate::exec::ExecEngine;
use crate::options::Settings;
use crate::scanners::{FixtureScanner, ScannerPlugin, ScoutScanner};
use crate::types::{CommandSpec, Execution};

/// 名称中包含该片段且无精确匹配时，退回内置自检扫描器
const FIXTURE_MARKER: &str = "test";

pub struct ScannerRegistry {
    runtime: String,
    scanners: BTreeMap<String, Arc<dyn ScannerPlugin>>,
    fixture: Arc<dyn ScannerPlugin>,
}

impl ScannerRegistry {
    pub fn new(runtime: impl Into<String>, fixture: Arc<dyn ScannerPlugin>) -> Self {
        Self { runtime: runtime.into(), scanners: BTreeMap::new(), fixture }
    }

    pub fn with_defaults(settings: &Settings) -> Self {
        let mut registry =
            Self::new(settings.container_runtime.clone(), Arc::new(FixtureScanner::new(&settings.fixture)));
        registry.register(Arc::new(ScoutScanner::new(&settings.scout)));
        registry
    }

    /// 同名（忽略大小写）时覆盖
    pub fn register(&mut self, plugin: Arc<dyn ScannerPlugin>) {
        self.scanners.insert(plugin.name().to_ascii_lowercase(), plugin);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn ScannerPlugin>, RunnerError> {
        let key = id.to_ascii_lowercase();
        if let Some(plugin) = self.scanners.get(&key) {
            return Ok(Arc::clone(plugin));
        }
        if key.contains(FIXTURE_MARKER) {
            return Ok(Arc::clone(&self.fixture));
        }
        Err(RunnerError::UnknownScanner { name: id.to_string(), registered: self.names().join(", ") })
    }

    pub fn names(&self) -> Vec<&str> {
        self.scanners.keys().map(String::as_str).collect()
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// 在 `context_dir` 中构建扫描器镜像
    pub fn build(&self, engine: &ExecEngine<'_>, id: &str, context_dir: &Path) -> Result<Execution, RunnerError> {
        let plugin = self.get(id)?;
        let spec = CommandSpec::new(format!("custom-build-{}", plugin.name()), plugin.build_command(&self.runtime))
            .in_dir(context_dir);
        Ok(run_logged(engine, spec)?)
    }

    /// 拉取扫描器镜像的最新版本
    pub fn update(&self, engine: &ExecEngine<'_>, id: &str) -> Result<Execution, RunnerError> {
        let plugin = self.get(id)?;
        let spec = CommandSpec::new(format!("custom-update-{}", plugin.name()), plugin.update_command(&self.runtime));
        Ok(run_logged(engine, spec)?)
    }
}

fn run_logged(engine: &ExecEngine<'_>, spec: CommandSpec) -> Result<Execution, ExecError> {
    let kind = spec.kind.clone();
    let execution = engine.exec(spec)?;
    info!(execution = %execution.id, %kind, ret = ?execution.ret, "maintenance command finished");
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ExecOptions;
    use crate::store::{MemoryStore, RecordStore};

    fn registry() -> ScannerRegistry {
        let mut settings = Settings::default();
        // 用 echo 代替容器运行时，只验证命令与记录
        settings.container_runtime = "echo".into();
        ScannerRegistry::with_defaults(&settings)
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let r = registry();
        assert_eq!(r.get("scout").unwrap().name(), "scout");
        assert_eq!(r.get("SCOUT").unwrap().name(), "scout");
        assert_eq!(r.get("Scout").unwrap().name(), "scout");
    }

    #[test]
    fn test_like_names_fall_back_to_fixture() {
        let r = registry();
        assert_eq!(r.get("test").unwrap().name(), "test");
        assert_eq!(r.get("my-Test-scanner").unwrap().name(), "test");
    }

    #[test]
    fn unknown_scanner_lists_registered() {
        let err = registry().get("slither").err().unwrap();
        match &err {
            RunnerError::UnknownScanner { name, registered } => {
                assert_eq!(name, "slither");
                assert_eq!(registered, "scout");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("registered: scout"));
    }

    #[test]
    fn update_and_build_are_recorded() {
        let store = MemoryStore::new();
        let engine = ExecEngine::new(&store, ExecOptions::default());
        let r = registry();

        let ex = r.update(&engine, "scout").unwrap();
        assert_eq!(ex.kind, "custom-update-scout");
        assert_eq!(ex.ret, Some(0));
        assert_eq!(store.stdout_text(ex.id).unwrap(), "pull coinfabrik/scout:latest");

        let dir = tempfile::tempdir().unwrap();
        let ex = r.build(&engine, "scout", dir.path()).unwrap();
        assert_eq!(ex.kind, "custom-build-scout");
        assert_eq!(store.stdout_text(ex.id).unwrap(), "build -t coinfabrik/scout:latest .");
        assert_eq!(store.executions().unwrap().len(), 2);
    }
}
