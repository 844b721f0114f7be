//! SQLite 存储（rusqlite）
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{RecordStore, StoreResult};
use crate::error::StoreError;
use crate::types::{
    Batch, BatchId, CommandSpec, Execution, ExecutionId, NewBatch, OutputLine, Report, ReportKind, ScanExecution,
    ScanId, ScanRequest, ScanState, Stream,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at  TEXT NOT NULL,
    name        TEXT NOT NULL,
    author      TEXT,
    email       TEXT,
    comments    TEXT
);
CREATE INDEX IF NOT EXISTS batch_created_at ON batch(created_at);

CREATE TABLE IF NOT EXISTS scan (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id         INTEGER REFERENCES batch(id),
    created_at       TEXT NOT NULL,
    repo             TEXT NOT NULL,
    commit_ref       TEXT NOT NULL,
    rev_hash         TEXT,
    path             TEXT NOT NULL,
    scanner          TEXT NOT NULL,
    scanner_version  TEXT,
    errors           TEXT,
    state            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS scan_batch ON scan(batch_id);
CREATE INDEX IF NOT EXISTS scan_scanner ON scan(scanner);

CREATE TABLE IF NOT EXISTS report (
    scan_id  INTEGER NOT NULL REFERENCES scan(id),
    is_raw   INTEGER NOT NULL,
    content  TEXT NOT NULL,
    PRIMARY KEY (scan_id, is_raw)
);

CREATE TABLE IF NOT EXISTS execution (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id     INTEGER REFERENCES scan(id),
    kind        TEXT NOT NULL,
    command     TEXT NOT NULL,
    workdir     TEXT,
    env         TEXT NOT NULL,
    started_at  TEXT,
    duration    REAL,
    ret         INTEGER
);
CREATE INDEX IF NOT EXISTS execution_kind ON execution(kind);

CREATE TABLE IF NOT EXISTS output_line (
    execution_id  INTEGER NOT NULL REFERENCES execution(id),
    is_out        INTEGER NOT NULL,
    idx           INTEGER NOT NULL,
    line          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS output_line_execution ON output_line(execution_id, is_out, idx);
"#;

const EXECUTION_COLUMNS: &str = "id, scan_id, kind, command, workdir, env, started_at, duration, ret";
const SCAN_COLUMNS: &str =
    "id, batch_id, created_at, repo, commit_ref, rev_hash, path, scanner, scanner_version, errors, state";
const BATCH_COLUMNS: &str = "id, created_at, name, author, email, comments";

/// 单连接 + 互斥锁；所有写入串行化
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件并初始化表结构
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// 同类命令的平均耗时（秒），保留一位小数
    pub fn average_duration(&self, kind: &str) -> StoreResult<f64> {
        let conn = self.conn()?;
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(duration) FROM execution WHERE kind = ?1 AND duration IS NOT NULL",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(avg.map(|a| (a * 10.0).round() / 10.0).unwrap_or(0.0))
    }
}

fn json_column(idx: usize, raw: &str) -> rusqlite::Result<BTreeMap<String, String>> {
    serde_json::from_str(raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<Execution> {
    let env: String = row.get(5)?;
    Ok(Execution {
        id: ExecutionId(row.get(0)?),
        scan: row.get::<_, Option<i64>>(1)?.map(ScanId),
        kind: row.get(2)?,
        command: row.get(3)?,
        workdir: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        env: json_column(5, &env)?,
        started_at: row.get(6)?,
        duration_secs: row.get(7)?,
        ret: row.get(8)?,
    })
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<ScanExecution> {
    let state: String = row.get(10)?;
    let state = state
        .parse::<ScanState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, e.into()))?;
    Ok(ScanExecution {
        id: ScanId(row.get(0)?),
        batch: row.get::<_, Option<i64>>(1)?.map(BatchId),
        created_at: row.get(2)?,
        repo: row.get(3)?,
        commit: row.get(4)?,
        rev_hash: row.get(5)?,
        path: row.get(6)?,
        scanner: row.get(7)?,
        scanner_version: row.get(8)?,
        errors: row.get(9)?,
        state,
    })
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<Batch> {
    Ok(Batch {
        id: BatchId(row.get(0)?),
        created_at: row.get(1)?,
        name: row.get(2)?,
        author: row.get(3)?,
        email: row.get(4)?,
        comments: row.get(5)?,
    })
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

impl RecordStore for SqliteStore {
    fn create_execution(&self, spec: &CommandSpec) -> StoreResult<Execution> {
        let env = serde_json::to_string(&spec.env)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO execution (scan_id, kind, command, workdir, env) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![spec.scan.map(|s| s.0), spec.kind, spec.command, path_text(&spec.workdir), env],
        )?;
        Ok(Execution {
            id: ExecutionId(conn.last_insert_rowid()),
            scan: spec.scan,
            kind: spec.kind.clone(),
            command: spec.command.clone(),
            workdir: spec.workdir.clone(),
            env: spec.env.clone(),
            started_at: None,
            duration_secs: None,
            ret: None,
        })
    }

    fn update_execution(&self, execution: &Execution) -> StoreResult<()> {
        let env = serde_json::to_string(&execution.env)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE execution SET scan_id = ?2, kind = ?3, command = ?4, workdir = ?5, env = ?6,
                    started_at = ?7, duration = ?8, ret = ?9
             WHERE id = ?1",
            params![
                execution.id.0,
                execution.scan.map(|s| s.0),
                execution.kind,
                execution.command,
                path_text(&execution.workdir),
                env,
                execution.started_at,
                execution.duration_secs,
                execution.ret,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ExecutionNotFound(execution.id));
        }
        Ok(())
    }

    fn execution(&self, id: ExecutionId) -> StoreResult<Execution> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM execution WHERE id = ?1"),
            params![id.0],
            execution_from_row,
        )
        .optional()?
        .ok_or(StoreError::ExecutionNotFound(id))
    }

    fn executions(&self) -> StoreResult<Vec<Execution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {EXECUTION_COLUMNS} FROM execution ORDER BY id"))?;
        let rows = stmt.query_map([], execution_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn append_lines(&self, lines: &[OutputLine]) -> StoreResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO output_line (execution_id, is_out, idx, line) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for l in lines {
                stmt.execute(params![l.execution.0, l.stream.is_out(), l.idx as i64, l.line])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn output_lines(&self, id: ExecutionId) -> StoreResult<Vec<OutputLine>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT is_out, idx, line FROM output_line WHERE execution_id = ?1 ORDER BY is_out DESC, idx ASC",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok(OutputLine {
                execution: id,
                stream: Stream::from_is_out(row.get(0)?),
                idx: row.get::<_, i64>(1)? as u64,
                line: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn clear_output(&self, id: ExecutionId) -> StoreResult<()> {
        self.conn()?.execute("DELETE FROM output_line WHERE execution_id = ?1", params![id.0])?;
        Ok(())
    }

    fn create_batch(&self, batch: &NewBatch) -> StoreResult<Batch> {
        let created_at: DateTime<Utc> = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO batch (created_at, name, author, email, comments) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![created_at, batch.name, batch.author, batch.email, batch.comments],
        )?;
        Ok(Batch {
            id: BatchId(conn.last_insert_rowid()),
            created_at,
            name: batch.name.clone(),
            author: batch.author.clone(),
            email: batch.email.clone(),
            comments: batch.comments.clone(),
        })
    }

    fn batch(&self, id: BatchId) -> StoreResult<Batch> {
        let conn = self.conn()?;
        conn.query_row(&format!("SELECT {BATCH_COLUMNS} FROM batch WHERE id = ?1"), params![id.0], batch_from_row)
            .optional()?
            .ok_or(StoreError::BatchNotFound(id))
    }

    fn batches(&self) -> StoreResult<Vec<Batch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {BATCH_COLUMNS} FROM batch ORDER BY created_at DESC, id DESC"))?;
        let rows = stmt.query_map([], batch_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn create_scan(&self, request: &ScanRequest) -> StoreResult<ScanExecution> {
        let created_at: DateTime<Utc> = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scan (batch_id, created_at, repo, commit_ref, path, scanner, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                request.batch.map(|b| b.0),
                created_at,
                request.repo,
                request.commit,
                request.path,
                request.scanner,
                ScanState::Created.as_str(),
            ],
        )?;
        Ok(ScanExecution {
            id: ScanId(conn.last_insert_rowid()),
            batch: request.batch,
            created_at,
            repo: request.repo.clone(),
            commit: request.commit.clone(),
            rev_hash: None,
            path: request.path.clone(),
            scanner: request.scanner.clone(),
            scanner_version: None,
            errors: None,
            state: ScanState::Created,
        })
    }

    fn update_scan(&self, scan: &ScanExecution) -> StoreResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE scan SET batch_id = ?2, repo = ?3, commit_ref = ?4, rev_hash = ?5, path = ?6, scanner = ?7,
                    scanner_version = ?8, errors = ?9, state = ?10
             WHERE id = ?1",
            params![
                scan.id.0,
                scan.batch.map(|b| b.0),
                scan.repo,
                scan.commit,
                scan.rev_hash,
                scan.path,
                scan.scanner,
                scan.scanner_version,
                scan.errors,
                scan.state.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::ScanNotFound(scan.id));
        }
        Ok(())
    }

    fn scan(&self, id: ScanId) -> StoreResult<ScanExecution> {
        let conn = self.conn()?;
        conn.query_row(&format!("SELECT {SCAN_COLUMNS} FROM scan WHERE id = ?1"), params![id.0], scan_from_row)
            .optional()?
            .ok_or(StoreError::ScanNotFound(id))
    }

    fn scans(&self) -> StoreResult<Vec<ScanExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {SCAN_COLUMNS} FROM scan ORDER BY created_at DESC, id DESC"))?;
        let rows = stmt.query_map([], scan_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn batch_scans(&self, batch: BatchId) -> StoreResult<Vec<ScanExecution>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {SCAN_COLUMNS} FROM scan WHERE batch_id = ?1 ORDER BY id"))?;
        let rows = stmt.query_map(params![batch.0], scan_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn save_report(&self, scan: ScanId, kind: ReportKind, content: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "INSERT INTO report (scan_id, is_raw, content) VALUES (?1, ?2, ?3)
             ON CONFLICT(scan_id, is_raw) DO UPDATE SET content = excluded.content",
            params![scan.0, kind.is_raw(), content],
        )?;
        Ok(())
    }

    fn report(&self, scan: ScanId, kind: ReportKind) -> StoreResult<Option<Report>> {
        let conn = self.conn()?;
        let content: Option<String> = conn
            .query_row(
                "SELECT content FROM report WHERE scan_id = ?1 AND is_raw = ?2",
                params![scan.0, kind.is_raw()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content.map(|content| Report { scan, kind, content }))
    }
}
