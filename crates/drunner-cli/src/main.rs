use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use drunner_core::{
    composite_report, parse_tasks, run_batch, submit_batch, write_composite_csv, BatchId, CommandSpec, ExecutionId,
    NewBatch, Orchestrator, ReportKind, ResultsReport, ScanId, ScanRequest, ScannerRegistry, Settings, SqliteStore,
};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "drunner", version, about = "容器化代码扫描任务执行器")]
struct Cli {
    /// 配置文件（TOML）；默认读取 DRUNNER_CONFIG 或 ./drunner.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 扫描单个仓库
    Scan {
        #[arg(long)]
        repo: String,

        #[arg(long, default_value = ScanRequest::DEFAULT_COMMIT)]
        commit: String,

        /// 仓库内的扫描路径
        #[arg(long, default_value = ScanRequest::DEFAULT_PATH)]
        path: String,

        #[arg(long, default_value = ScanRequest::DEFAULT_SCANNER)]
        scanner: String,

        /// 只登记，不运行
        #[arg(long)]
        no_run: bool,
    },

    /// 批量提交：每行 `repo,commit,path,scanner`
    Batch {
        /// 任务文件；"-" 表示标准输入
        #[arg(long)]
        tasks: PathBuf,

        #[arg(long)]
        name: String,

        #[arg(long)]
        author: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        comments: Option<String>,

        /// 并行数（"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,
    },

    /// 用已保存的原始报告重新生成归一化报告
    Rebuild { scan: i64 },

    /// 构建扫描器镜像
    Build {
        scanner: String,

        /// 构建上下文目录（含 Dockerfile）
        #[arg(long, default_value = ".")]
        context: PathBuf,
    },

    /// 拉取扫描器镜像
    Update { scanner: String },

    /// 执行任意命令并记录输出
    Exec {
        command: String,

        #[arg(long, default_value = "custom")]
        kind: String,

        #[arg(long)]
        workdir: Option<PathBuf>,

        /// 额外环境变量，格式 KEY=VALUE，可重复
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },

    /// 重新运行已记录的命令
    Replay {
        execution: i64,

        #[arg(long)]
        workdir: Option<PathBuf>,
    },

    /// 导出批次的聚合报告
    Export {
        batch: i64,

        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,

        /// 输出文件；缺省写到标准输出
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// 列出已记录的对象
    List {
        #[arg(value_enum, default_value_t = ListWhat::Scans)]
        what: ListWhat,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ListWhat {
    Scans,
    Batches,
    Executions,
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    let store = SqliteStore::open(&settings.database)
        .with_context(|| format!("open database {}", settings.database.display()))?;
    let registry = ScannerRegistry::with_defaults(&settings);
    let orch = Orchestrator::new(&store, &registry, &settings);

    match cli.command {
        Commands::Scan { repo, commit, path, scanner, no_run } => {
            let request = ScanRequest::new(repo).commit(commit).path(path).scanner(scanner);
            let scan = orch.submit(&request)?;
            println!("scan {}", scan.id);
            if !no_run {
                let done = orch.run(scan.id).context("scan failed")?;
                print_summary(&store, done.id)?;
            }
        }
        Commands::Batch { tasks, name, author, email, comments, threads } => {
            let text = read_tasks(&tasks)?;
            let requests = parse_tasks(&text);
            if requests.is_empty() {
                bail!("no tasks in {}", tasks.display());
            }
            let (batch, scans) = submit_batch(&orch, &NewBatch { name, author, email, comments }, requests)?;
            println!("batch {}", batch.id);
            let ids: Vec<ScanId> = scans.iter().map(|s| s.id).collect();
            let outcomes = run_batch(&orch, &ids, parse_threads(&threads))?;
            for outcome in &outcomes {
                println!("{}\t{}", outcome.scan, outcome.state);
            }
        }
        Commands::Rebuild { scan } => match orch.rebuild(ScanId(scan))? {
            Some(report) => println!("scan {scan}: {} findings", report.finding_count),
            None => println!("scan {scan}: no raw report"),
        },
        Commands::Build { scanner, context } => {
            let ex = registry.build(orch.engine(), &scanner, &context)?;
            finish_command(ex.ret)?;
        }
        Commands::Update { scanner } => {
            let ex = registry.update(orch.engine(), &scanner)?;
            finish_command(ex.ret)?;
        }
        Commands::Exec { command, kind, workdir, env } => {
            let mut spec = CommandSpec::new(kind, command);
            if let Some(dir) = workdir {
                spec = spec.in_dir(dir);
            }
            for (key, value) in env {
                spec = spec.with_env(key, value);
            }
            let ex = orch.engine().exec(spec)?;
            println!("execution {}", ex.id);
            finish_command(ex.ret)?;
        }
        Commands::Replay { execution, workdir } => {
            let ex = orch.engine().replay(ExecutionId(execution), workdir.as_deref())?;
            finish_command(ex.ret)?;
        }
        Commands::Export { batch, format, output } => {
            let out: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(File::create(path).context("create output file")?)),
                None => Box::new(io::stdout().lock()),
            };
            match format {
                ExportFormat::Csv => {
                    let rows = write_composite_csv(&store, BatchId(batch), out)?;
                    info!(batch, rows, "composite csv written");
                }
                ExportFormat::Json => {
                    let report = composite_report(&store, BatchId(batch))?;
                    let mut out = out;
                    serde_json::to_writer_pretty(&mut out, &report)?;
                    writeln!(out)?;
                    out.flush()?;
                }
            }
        }
        Commands::List { what } => list(&store, what)?,
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") {
        return None;
    }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

fn read_tasks(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).context("read tasks from stdin")?;
        return Ok(text);
    }
    fs::read_to_string(path).with_context(|| format!("read tasks file {}", path.display()))
}

fn finish_command(ret: Option<i32>) -> Result<()> {
    match ret {
        Some(0) => Ok(()),
        other => {
            error!(ret = ?other, "command failed");
            bail!("command exited with {other:?}")
        }
    }
}

fn print_summary(store: &SqliteStore, scan: ScanId) -> Result<()> {
    use drunner_core::RecordStore;
    let Some(report) = store.report(scan, ReportKind::Normalized)? else {
        return Ok(());
    };
    let report = ResultsReport::from_json(&report.content).context("stored report is not valid JSON")?;
    let tally = report.tally();
    println!("{}", report.name);
    println!(
        "findings: {} (high {}, medium {}, low {}, enhancement {}; score {:.2})",
        report.finding_count,
        tally.high,
        tally.medium,
        tally.low,
        tally.enhancement,
        tally.score()
    );
    Ok(())
}

fn list(store: &SqliteStore, what: ListWhat) -> Result<()> {
    use drunner_core::RecordStore;
    match what {
        ListWhat::Scans => {
            for s in store.scans()? {
                let batch = s.batch.map(|b| b.to_string()).unwrap_or_else(|| "-".into());
                println!("{}\t{}\t{}\t{}@{}:{}\t{}", s.id, batch, s.state, s.repo, s.commit, s.path, s.scanner);
            }
        }
        ListWhat::Batches => {
            for b in store.batches()? {
                println!("{}\t{}\t{}\t{}", b.id, b.created_at.to_rfc3339(), b.name, b.author.as_deref().unwrap_or("-"));
            }
        }
        ListWhat::Executions => {
            for row in execution_rows(store)? {
                println!("{row}");
            }
        }
    }
    Ok(())
}

/// 每行：id、种类、返回码、耗时、同类平均耗时、命令
fn execution_rows(store: &SqliteStore) -> Result<Vec<String>> {
    use drunner_core::RecordStore;
    let mut averages: BTreeMap<String, f64> = BTreeMap::new();
    let mut rows = Vec::new();
    for e in store.executions()? {
        let avg = match averages.get(&e.kind) {
            Some(avg) => *avg,
            None => {
                let avg = store.average_duration(&e.kind)?;
                averages.insert(e.kind.clone(), avg);
                avg
            }
        };
        let ret = e.ret.map(|r| r.to_string()).unwrap_or_else(|| "-".into());
        let took = e.duration_secs.map(|d| format!("{d:.1}s")).unwrap_or_else(|| "-".into());
        rows.push(format!("{}\t{}\t{}\t{}\tavg {avg:.1}s\t{}", e.id, e.kind, ret, took, e.command));
    }
    Ok(rows)
}
