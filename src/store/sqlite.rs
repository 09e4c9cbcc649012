//! Relational store on SQLite. Every mutating call runs inside one
//! immediate transaction on a single pooled connection, which serializes
//! writers and gives the claim/housekeeping primitives the linearizability
//! the contract demands. Rows mirror the wire model; free-form maps and
//! log windows are stored as JSON text.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::dispatch;
use crate::domain::job::{
    Classification, EngineKind, FailureReason, Priority, QueueClass, StateTransition,
};
use crate::domain::node::{NodeCapabilities, NodeStatus, NodeType};
use crate::domain::{Job, JobRequest, Node, NodeRegistration};
use crate::lifecycle::{JobStatus, RetryPolicy, SlaTargets};
use crate::store::mutations::{self, RetryDisposition};
use crate::store::{FinalizeOutcome, Registered, Store, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    job_id                 TEXT PRIMARY KEY,
    sequence_number        INTEGER NOT NULL UNIQUE,
    scenario               TEXT NOT NULL,
    engine                 TEXT NOT NULL,
    parameters             TEXT NOT NULL DEFAULT '{}',
    queue                  TEXT NOT NULL,
    priority               TEXT NOT NULL,
    classification         TEXT,
    status                 TEXT NOT NULL,
    progress               INTEGER NOT NULL DEFAULT 0,
    node_id                TEXT NOT NULL DEFAULT '',
    retry_count            INTEGER NOT NULL DEFAULT 0,
    max_retries            INTEGER NOT NULL DEFAULT 3,
    created_at             TEXT NOT NULL,
    started_at             TEXT,
    last_activity_at       TEXT,
    completed_at           TEXT,
    timeout_at             TEXT,
    retry_at               TEXT,
    retry_reason           TEXT,
    error                  TEXT,
    failure_reason         TEXT,
    logs                   TEXT NOT NULL DEFAULT '[]',
    platform_sla_compliant INTEGER,
    platform_sla_reason    TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status   ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(queue, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_node     ON jobs(node_id);

CREATE TABLE IF NOT EXISTS nodes (
    node_id          TEXT PRIMARY KEY,
    address          TEXT NOT NULL UNIQUE,
    name             TEXT NOT NULL,
    node_type        TEXT NOT NULL,
    cpu_threads      INTEGER NOT NULL,
    cpu_model        TEXT NOT NULL DEFAULT '',
    ram_total_bytes  INTEGER NOT NULL DEFAULT 0,
    has_gpu          INTEGER NOT NULL DEFAULT 0,
    gpu_type         TEXT,
    gpu_capabilities TEXT NOT NULL DEFAULT '[]',
    labels           TEXT NOT NULL DEFAULT '{}',
    status           TEXT NOT NULL,
    current_job_id   TEXT NOT NULL DEFAULT '',
    last_heartbeat   TEXT NOT NULL,
    registered_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_status ON nodes(status);

CREATE TABLE IF NOT EXISTS state_transitions (
    job_id      TEXT NOT NULL,
    from_status TEXT,
    to_status   TEXT NOT NULL,
    at          TEXT NOT NULL,
    reason      TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (job_id, at)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry_policy: RetryPolicy,
    sla_targets: SlaTargets,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Backend(format!("corrupt {what} value in catalog: {value:?}"))
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", s))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Private scratch database; used by tests and `--store memory` is the
    /// usual alternative.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry_policy: RetryPolicy::default(),
            sla_targets: SlaTargets::default(),
        })
    }

    pub fn with_policies(mut self, retry_policy: RetryPolicy, sla_targets: SlaTargets) -> Self {
        self.retry_policy = retry_policy;
        self.sla_targets = sla_targets;
        self
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// Row shuttling.

struct RawJob {
    job_id: String,
    sequence_number: u64,
    scenario: String,
    engine: String,
    parameters: String,
    queue: String,
    priority: String,
    classification: Option<String>,
    status: String,
    progress: u8,
    node_id: String,
    retry_count: u32,
    max_retries: u32,
    created_at: String,
    started_at: Option<String>,
    last_activity_at: Option<String>,
    completed_at: Option<String>,
    timeout_at: Option<String>,
    retry_at: Option<String>,
    retry_reason: Option<String>,
    error: Option<String>,
    failure_reason: Option<String>,
    logs: String,
    platform_sla_compliant: Option<bool>,
    platform_sla_reason: Option<String>,
}

const JOB_COLUMNS: &str = "job_id, sequence_number, scenario, engine, parameters, queue, \
     priority, classification, status, progress, node_id, retry_count, max_retries, \
     created_at, started_at, last_activity_at, completed_at, timeout_at, retry_at, \
     retry_reason, error, failure_reason, logs, platform_sla_compliant, platform_sla_reason";

fn raw_job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        job_id: row.get(0)?,
        sequence_number: row.get(1)?,
        scenario: row.get(2)?,
        engine: row.get(3)?,
        parameters: row.get(4)?,
        queue: row.get(5)?,
        priority: row.get(6)?,
        classification: row.get(7)?,
        status: row.get(8)?,
        progress: row.get(9)?,
        node_id: row.get(10)?,
        retry_count: row.get(11)?,
        max_retries: row.get(12)?,
        created_at: row.get(13)?,
        started_at: row.get(14)?,
        last_activity_at: row.get(15)?,
        completed_at: row.get(16)?,
        timeout_at: row.get(17)?,
        retry_at: row.get(18)?,
        retry_reason: row.get(19)?,
        error: row.get(20)?,
        failure_reason: row.get(21)?,
        logs: row.get(22)?,
        platform_sla_compliant: row.get(23)?,
        platform_sla_reason: row.get(24)?,
    })
}

fn job_from_raw(raw: RawJob, transitions: Vec<StateTransition>) -> Result<Job, StoreError> {
    Ok(Job {
        job_id: raw.job_id,
        sequence_number: raw.sequence_number,
        scenario: raw.scenario,
        engine: EngineKind::parse(&raw.engine).ok_or_else(|| corrupt("engine", &raw.engine))?,
        parameters: serde_json::from_str(&raw.parameters)
            .map_err(|_| corrupt("parameters", &raw.parameters))?,
        queue: QueueClass::parse(&raw.queue).ok_or_else(|| corrupt("queue", &raw.queue))?,
        priority: Priority::parse(&raw.priority)
            .ok_or_else(|| corrupt("priority", &raw.priority))?,
        classification: raw
            .classification
            .as_deref()
            .map(|c| Classification::parse(c).ok_or_else(|| corrupt("classification", c)))
            .transpose()?,
        status: JobStatus::parse(&raw.status).ok_or_else(|| corrupt("status", &raw.status))?,
        progress: raw.progress,
        node_id: raw.node_id,
        retry_count: raw.retry_count,
        max_retries: raw.max_retries,
        created_at: parse_ts(&raw.created_at)?,
        started_at: parse_ts_opt(raw.started_at)?,
        last_activity_at: parse_ts_opt(raw.last_activity_at)?,
        completed_at: parse_ts_opt(raw.completed_at)?,
        timeout_at: parse_ts_opt(raw.timeout_at)?,
        retry_at: parse_ts_opt(raw.retry_at)?,
        retry_reason: raw.retry_reason,
        error: raw.error,
        failure_reason: raw
            .failure_reason
            .as_deref()
            .map(|r| FailureReason::parse(r).ok_or_else(|| corrupt("failure_reason", r)))
            .transpose()?,
        logs: serde_json::from_str(&raw.logs).map_err(|_| corrupt("logs", &raw.logs))?,
        platform_sla_compliant: raw.platform_sla_compliant,
        platform_sla_reason: raw.platform_sla_reason,
        state_transitions: transitions,
    })
}

fn load_transitions(tx: &Transaction<'_>, job_id: &str) -> Result<Vec<StateTransition>, StoreError> {
    let mut stmt = tx.prepare(
        "SELECT from_status, to_status, at, reason FROM state_transitions \
         WHERE job_id = ?1 ORDER BY at ASC",
    )?;
    let rows = stmt.query_map(params![job_id], |row| {
        Ok((
            row.get::<_, Option<String>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (from, to, at, reason) = row?;
        out.push(StateTransition {
            from: from
                .as_deref()
                .map(|f| JobStatus::parse(f).ok_or_else(|| corrupt("from_status", f)))
                .transpose()?,
            to: JobStatus::parse(&to).ok_or_else(|| corrupt("to_status", &to))?,
            at: parse_ts(&at)?,
            reason,
        });
    }
    Ok(out)
}

fn load_job(tx: &Transaction<'_>, job_id: &str) -> Result<Job, StoreError> {
    let raw = tx
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
            params![job_id],
            raw_job_from_row,
        )
        .optional()?
        .ok_or(StoreError::JobNotFound)?;
    let transitions = load_transitions(tx, job_id)?;
    job_from_raw(raw, transitions)
}

fn load_jobs_where(
    tx: &Transaction<'_>,
    clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Job>, StoreError> {
    let mut stmt = tx.prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE {clause}"))?;
    let raws: Vec<RawJob> = stmt
        .query_map(args, raw_job_from_row)?
        .collect::<rusqlite::Result<_>>()?;
    let mut jobs = Vec::with_capacity(raws.len());
    for raw in raws {
        let transitions = load_transitions(tx, &raw.job_id)?;
        jobs.push(job_from_raw(raw, transitions)?);
    }
    Ok(jobs)
}

/// Persist the job row and append any audit entries not yet on disk.
/// Transitions already stored stay untouched (the log is append-only).
fn save_job(tx: &Transaction<'_>, job: &Job) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE jobs SET scenario = ?2, engine = ?3, parameters = ?4, queue = ?5, \
         priority = ?6, classification = ?7, status = ?8, progress = ?9, node_id = ?10, \
         retry_count = ?11, max_retries = ?12, created_at = ?13, started_at = ?14, \
         last_activity_at = ?15, completed_at = ?16, timeout_at = ?17, retry_at = ?18, \
         retry_reason = ?19, error = ?20, failure_reason = ?21, logs = ?22, \
         platform_sla_compliant = ?23, platform_sla_reason = ?24 \
         WHERE job_id = ?1",
        params![
            job.job_id,
            job.scenario,
            job.engine.as_str(),
            serde_json::to_string(&job.parameters).unwrap_or_else(|_| "{}".into()),
            job.queue.as_str(),
            job.priority.as_str(),
            job.classification.map(|c| c.as_str()),
            job.status.as_str(),
            job.progress,
            job.node_id,
            job.retry_count,
            job.max_retries,
            ts(job.created_at),
            job.started_at.map(ts),
            job.last_activity_at.map(ts),
            job.completed_at.map(ts),
            job.timeout_at.map(ts),
            job.retry_at.map(ts),
            job.retry_reason,
            job.error,
            job.failure_reason.map(|r| r.as_str()),
            serde_json::to_string(&job.logs).unwrap_or_else(|_| "[]".into()),
            job.platform_sla_compliant,
            job.platform_sla_reason,
        ],
    )?;
    append_new_transitions(tx, job)
}

fn append_new_transitions(tx: &Transaction<'_>, job: &Job) -> Result<(), StoreError> {
    let stored: u64 = tx.query_row(
        "SELECT COUNT(*) FROM state_transitions WHERE job_id = ?1",
        params![job.job_id],
        |row| row.get(0),
    )?;
    for t in job.state_transitions.iter().skip(stored as usize) {
        tx.execute(
            "INSERT INTO state_transitions (job_id, from_status, to_status, at, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.job_id,
                t.from.map(|f| f.as_str()),
                t.to.as_str(),
                ts(t.at),
                t.reason,
            ],
        )?;
    }
    Ok(())
}

fn insert_job(tx: &Transaction<'_>, job: &Job) -> Result<(), StoreError> {
    tx.execute(
        &format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, \
             ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
        ),
        params![
            job.job_id,
            job.sequence_number,
            job.scenario,
            job.engine.as_str(),
            serde_json::to_string(&job.parameters).unwrap_or_else(|_| "{}".into()),
            job.queue.as_str(),
            job.priority.as_str(),
            job.classification.map(|c| c.as_str()),
            job.status.as_str(),
            job.progress,
            job.node_id,
            job.retry_count,
            job.max_retries,
            ts(job.created_at),
            job.started_at.map(ts),
            job.last_activity_at.map(ts),
            job.completed_at.map(ts),
            job.timeout_at.map(ts),
            job.retry_at.map(ts),
            job.retry_reason,
            job.error,
            job.failure_reason.map(|r| r.as_str()),
            serde_json::to_string(&job.logs).unwrap_or_else(|_| "[]".into()),
            job.platform_sla_compliant,
            job.platform_sla_reason,
        ],
    )?;
    append_new_transitions(tx, job)
}

const NODE_COLUMNS: &str = "node_id, address, name, node_type, cpu_threads, cpu_model, \
     ram_total_bytes, has_gpu, gpu_type, gpu_capabilities, labels, status, current_job_id, \
     last_heartbeat, registered_at";

struct RawNode {
    node_id: String,
    address: String,
    name: String,
    node_type: String,
    cpu_threads: u32,
    cpu_model: String,
    ram_total_bytes: u64,
    has_gpu: bool,
    gpu_type: Option<String>,
    gpu_capabilities: String,
    labels: String,
    status: String,
    current_job_id: String,
    last_heartbeat: String,
    registered_at: String,
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawNode> {
    Ok(RawNode {
        node_id: row.get(0)?,
        address: row.get(1)?,
        name: row.get(2)?,
        node_type: row.get(3)?,
        cpu_threads: row.get(4)?,
        cpu_model: row.get(5)?,
        ram_total_bytes: row.get(6)?,
        has_gpu: row.get(7)?,
        gpu_type: row.get(8)?,
        gpu_capabilities: row.get(9)?,
        labels: row.get(10)?,
        status: row.get(11)?,
        current_job_id: row.get(12)?,
        last_heartbeat: row.get(13)?,
        registered_at: row.get(14)?,
    })
}

fn finish_node(raw: RawNode) -> Result<Node, StoreError> {
    Ok(Node {
        node_id: raw.node_id,
        address: raw.address,
        name: raw.name,
        node_type: NodeType::parse(&raw.node_type)
            .ok_or_else(|| corrupt("node_type", &raw.node_type))?,
        capabilities: NodeCapabilities {
            cpu_threads: raw.cpu_threads,
            cpu_model: raw.cpu_model,
            ram_total_bytes: raw.ram_total_bytes,
            has_gpu: raw.has_gpu,
            gpu_type: raw.gpu_type,
            gpu_capabilities: serde_json::from_str(&raw.gpu_capabilities)
                .map_err(|_| corrupt("gpu_capabilities", &raw.gpu_capabilities))?,
            labels: serde_json::from_str(&raw.labels).map_err(|_| corrupt("labels", &raw.labels))?,
        },
        status: NodeStatus::parse(&raw.status).ok_or_else(|| corrupt("node status", &raw.status))?,
        current_job_id: raw.current_job_id,
        last_heartbeat: parse_ts(&raw.last_heartbeat)?,
        registered_at: parse_ts(&raw.registered_at)?,
    })
}

fn load_node(tx: &Transaction<'_>, node_id: &str) -> Result<Node, StoreError> {
    tx.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = ?1"),
        params![node_id],
        node_from_row,
    )
    .optional()?
    .ok_or(StoreError::NodeNotFound)
    .and_then(finish_node)
}

fn save_node(tx: &Transaction<'_>, node: &Node) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE nodes SET address = ?2, name = ?3, node_type = ?4, cpu_threads = ?5, \
         cpu_model = ?6, ram_total_bytes = ?7, has_gpu = ?8, gpu_type = ?9, \
         gpu_capabilities = ?10, labels = ?11, status = ?12, current_job_id = ?13, \
         last_heartbeat = ?14, registered_at = ?15 WHERE node_id = ?1",
        params![
            node.node_id,
            node.address,
            node.name,
            node.node_type.as_str(),
            node.capabilities.cpu_threads,
            node.capabilities.cpu_model,
            node.capabilities.ram_total_bytes,
            node.capabilities.has_gpu,
            node.capabilities.gpu_type,
            serde_json::to_string(&node.capabilities.gpu_capabilities)
                .unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&node.capabilities.labels).unwrap_or_else(|_| "{}".into()),
            node.status.as_str(),
            node.current_job_id,
            ts(node.last_heartbeat),
            ts(node.registered_at),
        ],
    )?;
    Ok(())
}

fn insert_node(tx: &Transaction<'_>, node: &Node) -> Result<(), StoreError> {
    tx.execute(
        &format!(
            "INSERT INTO nodes ({NODE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, \
             ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            node.node_id,
            node.address,
            node.name,
            node.node_type.as_str(),
            node.capabilities.cpu_threads,
            node.capabilities.cpu_model,
            node.capabilities.ram_total_bytes,
            node.capabilities.has_gpu,
            node.capabilities.gpu_type,
            serde_json::to_string(&node.capabilities.gpu_capabilities)
                .unwrap_or_else(|_| "[]".into()),
            serde_json::to_string(&node.capabilities.labels).unwrap_or_else(|_| "{}".into()),
            node.status.as_str(),
            node.current_job_id,
            ts(node.last_heartbeat),
            ts(node.registered_at),
        ],
    )?;
    Ok(())
}

fn load_node_for_job(tx: &Transaction<'_>, job: &Job) -> Result<Option<Node>, StoreError> {
    if job.node_id.is_empty() {
        return Ok(None);
    }
    match load_node(tx, &job.node_id) {
        Ok(node) => Ok(Some(node)),
        Err(StoreError::NodeNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Store for SqliteStore {
    fn register_node(&self, reg: NodeRegistration) -> Result<Registered, StoreError> {
        self.with_tx(|tx| {
            let existing = tx
                .query_row(
                    &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE address = ?1"),
                    params![reg.address],
                    node_from_row,
                )
                .optional()?
                .map(finish_node)
                .transpose()?;

            match existing {
                Some(mut node) => {
                    node.apply_reregistration(reg);
                    save_node(tx, &node)?;
                    Ok(Registered {
                        node,
                        created: false,
                    })
                }
                None => {
                    let node = Node::from_registration(reg);
                    insert_node(tx, &node)?;
                    Ok(Registered {
                        node,
                        created: true,
                    })
                }
            }
        })
    }

    fn get_node(&self, node_id: &str) -> Result<Node, StoreError> {
        self.with_tx(|tx| load_node(tx, node_id))
    }

    fn get_node_by_address(&self, address: &str) -> Result<Option<Node>, StoreError> {
        self.with_tx(|tx| {
            tx.query_row(
                &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE address = ?1"),
                params![address],
                node_from_row,
            )
            .optional()?
            .map(finish_node)
            .transpose()
        })
    }

    fn get_all_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {NODE_COLUMNS} FROM nodes ORDER BY registered_at ASC"
            ))?;
            let rows: Vec<_> = stmt
                .query_map([], node_from_row)?
                .collect::<rusqlite::Result<_>>()?;
            rows.into_iter().map(finish_node).collect()
        })
    }

    fn delete_node(&self, node_id: &str) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let node = load_node(tx, node_id)?;
            if node.status == NodeStatus::Busy || !node.current_job_id.is_empty() {
                return Err(StoreError::NodeBusy);
            }
            tx.execute("DELETE FROM nodes WHERE node_id = ?1", params![node_id])?;
            Ok(())
        })
    }

    fn update_node_heartbeat(&self, node_id: &str) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut node = load_node(tx, node_id)?;
            node.last_heartbeat = Utc::now();
            save_node(tx, &node)?;
            if !node.current_job_id.is_empty() {
                tx.execute(
                    "UPDATE jobs SET last_activity_at = ?2 WHERE job_id = ?1",
                    params![node.current_job_id, ts(node.last_heartbeat)],
                )?;
            }
            Ok(())
        })
    }

    fn update_node_status(&self, node_id: &str, status: NodeStatus) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let mut node = load_node(tx, node_id)?;
            node.status = status;
            save_node(tx, &node)
        })
    }

    fn create_job(&self, req: JobRequest) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let seq: u64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM jobs",
                [],
                |row| row.get(0),
            )?;
            let job = Job::from_request(req, seq);
            insert_job(tx, &job)?;
            Ok(job)
        })
    }

    fn get_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.with_tx(|tx| load_job(tx, job_id))
    }

    fn get_job_by_sequence(&self, sequence_number: u64) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let id: Option<String> = tx
                .query_row(
                    "SELECT job_id FROM jobs WHERE sequence_number = ?1",
                    params![sequence_number],
                    |row| row.get(0),
                )
                .optional()?;
            let id = id.ok_or(StoreError::JobNotFound)?;
            load_job(tx, &id)
        })
    }

    fn get_all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.with_tx(|tx| {
            let mut jobs = load_jobs_where(tx, "1 = 1", &[])?;
            jobs.sort_by_key(|j| j.sequence_number);
            Ok(jobs)
        })
    }

    fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            // Existence check keeps the not-found contract of the memory
            // variant; UPDATE alone would silently no-op.
            load_job(tx, &job.job_id)?;
            save_job(tx, job)
        })
    }

    fn update_job_status(
        &self,
        job_id: &str,
        to: JobStatus,
        reason: &str,
    ) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            let mut node = load_node_for_job(tx, &job)?;
            mutations::transition(&mut job, to, reason)?;
            if !to.is_active() {
                job.node_id.clear();
                if let Some(node) = node.as_mut() {
                    mutations::release_node(node);
                    save_node(tx, node)?;
                }
            }
            save_job(tx, &job)?;
            Ok(job)
        })
    }

    fn update_job_activity(&self, job_id: &str) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE jobs SET last_activity_at = ?2 WHERE job_id = ?1",
                params![job_id, ts(Utc::now())],
            )?;
            if updated == 0 {
                return Err(StoreError::JobNotFound);
            }
            Ok(())
        })
    }

    fn update_job_progress(&self, job_id: &str, progress: u8) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            if job.status == JobStatus::Assigned {
                mutations::transition(&mut job, JobStatus::Running, "first progress report")?;
            }
            if job.status == JobStatus::Running {
                job.progress = progress.min(100);
                job.last_activity_at = Some(Utc::now());
                save_job(tx, &job)?;
            }
            Ok(job)
        })
    }

    fn pause_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            let mut node = load_node_for_job(tx, &job)?;
            mutations::pause(&mut job, node.as_mut())?;
            if let Some(node) = node.as_ref() {
                save_node(tx, node)?;
            }
            save_job(tx, &job)?;
            Ok(job)
        })
    }

    fn resume_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            mutations::resume(&mut job)?;
            save_job(tx, &job)?;
            Ok(job)
        })
    }

    fn cancel_job(&self, job_id: &str) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            let mut node = load_node_for_job(tx, &job)?;
            mutations::cancel(&mut job, node.as_mut())?;
            if let Some(node) = node.as_ref() {
                save_node(tx, node)?;
            }
            save_job(tx, &job)?;
            Ok(job)
        })
    }

    fn retry_job(&self, job_id: &str, reason: &str) -> Result<Job, StoreError> {
        let immediate = reason == "worker_died";
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            let mut node = load_node_for_job(tx, &job)?;
            mutations::retry(&mut job, node.as_mut(), reason, &self.retry_policy, immediate)?;
            if let Some(node) = node.as_ref() {
                save_node(tx, node)?;
            }
            save_job(tx, &job)?;
            Ok(job)
        })
    }

    fn finalize_job(&self, job_id: &str, outcome: FinalizeOutcome) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut job = load_job(tx, job_id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let mut node = load_node_for_job(tx, &job)?;
            mutations::finalize(&mut job, node.as_mut(), outcome, &self.sla_targets)?;
            if let Some(node) = node.as_ref() {
                save_node(tx, node)?;
            }
            save_job(tx, &job)?;
            Ok(job)
        })
    }

    fn try_queue_pending_job(&self, job_id: &str) -> Result<bool, StoreError> {
        self.with_tx(|tx| {
            let job = load_job(tx, job_id)?;
            Ok(job.status == JobStatus::Queued && job.node_id.is_empty())
        })
    }

    fn get_next_job(&self, node_id: &str) -> Result<Job, StoreError> {
        self.with_tx(|tx| {
            let mut node = load_node(tx, node_id)?;
            if node.status != NodeStatus::Available {
                return Err(StoreError::NoJobAvailable);
            }
            // Selection happens in Rust so both store variants share the
            // exact same ordering and capability semantics.
            let queued = load_jobs_where(tx, "status = 'queued' AND node_id = ''", &[])?;
            let mut job = dispatch::select_candidate(queued.iter(), &node)
                .cloned()
                .ok_or(StoreError::NoJobAvailable)?;
            mutations::claim(&mut job, &mut node)?;
            save_job(tx, &job)?;
            save_node(tx, &node)?;
            Ok(job)
        })
    }

    fn reassign_orphaned_jobs(&self, node_id: &str) -> Result<Vec<String>, StoreError> {
        self.with_tx(|tx| {
            let mut node = load_node(tx, node_id)?;
            node.status = NodeStatus::Offline;
            node.current_job_id.clear();
            save_node(tx, &node)?;

            let orphaned = load_jobs_where(
                tx,
                "node_id = ?1 AND status NOT IN ('completed', 'failed', 'canceled')",
                &[&node_id],
            )?;
            let mut requeued = Vec::new();
            for mut job in orphaned {
                let disposition =
                    mutations::retry(&mut job, None, "worker_died", &self.retry_policy, true)?;
                save_job(tx, &job)?;
                if disposition == RetryDisposition::Requeued {
                    requeued.push(job.job_id);
                }
            }
            Ok(requeued)
        })
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    fn sla_targets(&self) -> &SlaTargets {
        &self.sla_targets
    }
}
