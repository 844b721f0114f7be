//! 进程执行引擎
//!
//! 每条命令对应三个并发单元：
//! - 两个读线程分别读取 stdout / stderr，按流内序号打标后成批入队；
//! - 一个落库线程从有界队列取批，按 `batch_size` 分块写入存储（每块一个事务）。
//!
//! 完成顺序：等待进程退出 → 汇合两个读线程 → 发送结束标记 → 汇合落库线程 →
//! 记录返回码与耗时。队列满时读线程先继续积攒，超过去抖窗口或管道暂时读空时
//! 改为阻塞入队，因此存储变慢只会形成背压，不会丢行。
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{self as channel, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::error::ExecError;
use crate::options::ExecOptions;
use crate::shell::{sanitize, shell_command};
use crate::store::RecordStore;
use crate::types::{CommandSpec, Execution, ExecutionId, OutputLine, Stream};

/// 队列消息；`None` 为结束标记
type LineBatch = Option<Vec<OutputLine>>;

/// 落库线程的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PersistStats {
    written: usize,
    failed: usize,
}

pub struct ExecEngine<'a> {
    store: &'a dyn RecordStore,
    options: ExecOptions,
}

impl<'a> ExecEngine<'a> {
    pub fn new(store: &'a dyn RecordStore, options: ExecOptions) -> Self {
        Self { store, options }
    }

    /// 新建执行记录并运行到结束
    pub fn exec(&self, spec: CommandSpec) -> Result<Execution, ExecError> {
        let mut execution = self.store.create_execution(&spec)?;
        self.run_recorded(&mut execution, false)?;
        Ok(execution)
    }

    /// 重新运行已存储的执行记录（排队任务、重试）
    ///
    /// 旧输出与返回码只在新进程启动成功后才清除；启动失败时记录保持原样。
    /// 记录的工作目录已不存在（扫描的临时目录通常已被删除）且未显式指定时，
    /// 在新的临时目录中运行。
    pub fn replay(&self, id: ExecutionId, workdir: Option<&Path>) -> Result<Execution, ExecError> {
        let mut execution = self.store.execution(id)?;
        let mut _scratch = None;
        match workdir {
            Some(dir) => execution.workdir = Some(dir.to_path_buf()),
            None => {
                if let Some(stale) = execution.workdir.clone().filter(|dir| !dir.is_dir()) {
                    let dir = tempfile::Builder::new()
                        .prefix(&format!("drunner-{}-", sanitize(&execution.kind)))
                        .suffix("tmp")
                        .tempdir()
                        .map_err(ExecError::Workdir)?;
                    warn!(
                        execution = %id,
                        recorded = %stale.display(),
                        dir = %dir.path().display(),
                        "recorded working directory is gone, replaying in a fresh one"
                    );
                    execution.workdir = Some(dir.path().to_path_buf());
                    _scratch = Some(dir);
                }
            }
        }
        self.run_recorded(&mut execution, true)?;
        Ok(execution)
    }

    fn run_recorded(&self, execution: &mut Execution, replaying: bool) -> Result<(), ExecError> {
        debug!(execution = %execution.id, kind = %execution.kind, command = %execution.command, "starting command");

        let mut command = shell_command(&execution.command);
        if let Some(dir) = &execution.workdir {
            command.current_dir(dir);
        }
        command.envs(&execution.env).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|source| ExecError::Spawn { command: execution.command.clone(), source })?;
        if let Err(err) = self.mark_started(execution, replaying) {
            abandon(&mut child, execution.id);
            return Err(err);
        }
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (tx, rx) = channel::bounded::<LineBatch>(self.options.queue_capacity.max(1));
        let id = execution.id;
        let debounce = self.options.debounce();
        let batch_size = self.options.batch_size.max(1);
        let store = self.store;

        let (status, counts, stats) = thread::scope(|s| {
            let persister = s.spawn(move || persist_lines(store, rx, batch_size));
            let out_reader = stdout.map(|pipe| {
                let tx = tx.clone();
                s.spawn(move || read_stream(pipe, id, Stream::Stdout, &tx, debounce))
            });
            let err_reader = stderr.map(|pipe| {
                let tx = tx.clone();
                s.spawn(move || read_stream(pipe, id, Stream::Stderr, &tx, debounce))
            });

            let status = child.wait();
            let counts = [out_reader, err_reader].map(|reader| match reader.map(|h| h.join()) {
                Some(Ok(n)) => n,
                Some(Err(_)) => {
                    error!(execution = %id, "output reader panicked");
                    0
                }
                None => 0,
            });

            // 两个读线程都已结束，通知落库线程收尾
            if tx.send(None).is_err() {
                error!(execution = %id, "persistence thread gone before end of output");
            }
            drop(tx);
            let stats = persister.join().unwrap_or_else(|_| {
                error!(execution = %id, "persistence thread panicked");
                PersistStats::default()
            });
            (status, counts, stats)
        });

        execution.duration_secs = Some(started.elapsed().as_secs_f64());
        let status = match status {
            Ok(status) => status,
            Err(source) => {
                self.store.update_execution(execution)?;
                return Err(ExecError::Wait { command: execution.command.clone(), source });
            }
        };
        execution.ret = Some(exit_code(status));
        self.store.update_execution(execution)?;

        info!(
            execution = %id,
            kind = %execution.kind,
            ret = ?execution.ret,
            duration = ?execution.duration_secs,
            stdout_lines = counts[0],
            stderr_lines = counts[1],
            lines_written = stats.written,
            lines_failed = stats.failed,
            "command finished"
        );
        Ok(())
    }

    /// 进程已启动：重放时先清掉上一次的输出与结果，再记录开始时间
    fn mark_started(&self, execution: &mut Execution, replaying: bool) -> Result<(), ExecError> {
        execution.started_at = Some(Utc::now());
        if replaying {
            execution.ret = None;
            execution.duration_secs = None;
            self.store.clear_output(execution.id)?;
        }
        self.store.update_execution(execution)?;
        Ok(())
    }
}

/// 记录无法更新时终止刚启动的进程
fn abandon(child: &mut Child, execution: ExecutionId) {
    if let Err(err) = child.kill() {
        warn!(execution = %execution, %err, "failed to kill command");
    }
    let _ = child.wait();
}

/// 读到 EOF 为止，返回读到的行数
fn read_stream<R: Read>(
    pipe: R,
    execution: ExecutionId,
    stream: Stream,
    tx: &Sender<LineBatch>,
    debounce: Duration,
) -> u64 {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut idx: u64 = 0;
    let mut pending: Vec<OutputLine> = Vec::new();
    let mut last_enqueue = Instant::now();
    let mut connected = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                error!(execution = %execution, ?stream, %err, "failed to read command output");
                break;
            }
        }
        pending.push(OutputLine { execution, stream, idx, line: decode_line(&buf) });
        idx += 1;

        // 落库线程已退出时仍需读空管道，避免子进程阻塞
        if !connected {
            pending.clear();
            continue;
        }
        match tx.try_send(Some(std::mem::take(&mut pending))) {
            Ok(()) => last_enqueue = Instant::now(),
            Err(TrySendError::Full(batch)) => {
                pending = batch.unwrap_or_default();
                // 缓冲区已读空说明下一次读取会阻塞，先把积攒的行交出去
                if last_enqueue.elapsed() >= debounce || reader.buffer().is_empty() {
                    connected = tx.send(Some(std::mem::take(&mut pending))).is_ok();
                    last_enqueue = Instant::now();
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                error!(execution = %execution, ?stream, "persistence queue closed, dropping output");
                connected = false;
            }
        }
    }

    if connected && !pending.is_empty() && tx.send(Some(pending)).is_err() {
        error!(execution = %execution, ?stream, "persistence queue closed before final batch");
    }
    idx
}

/// 取出当前已到达的全部批次，再按 `batch_size` 分块写入；收到结束标记后退出
fn persist_lines(store: &dyn RecordStore, rx: Receiver<LineBatch>, batch_size: usize) -> PersistStats {
    let mut stats = PersistStats::default();
    let mut done = false;

    while !done {
        let mut lines: Vec<OutputLine> = Vec::new();
        let mut next = rx.recv().ok();
        if next.is_none() {
            // 所有发送端都已释放
            break;
        }
        while let Some(msg) = next {
            match msg {
                Some(mut batch) => lines.append(&mut batch),
                None => {
                    done = true;
                    break;
                }
            }
            next = rx.try_recv().ok();
        }

        for chunk in lines.chunks(batch_size) {
            match store.append_lines(chunk) {
                Ok(()) => stats.written += chunk.len(),
                Err(err) => {
                    error!(error = %err, lines = chunk.len(), "failed to persist output lines");
                    stats.failed += chunk.len();
                }
            }
        }
    }
    stats
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\n', '\r']).to_string()
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
