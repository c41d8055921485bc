use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FailureKind, StoreError};
use crate::record::Interval;
use crate::task::{TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
    Retry,
}

/// Estado persistido de una tarea dentro de un run. Uno por
/// (pipeline, intervalo, tarea); la última versión manda.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub pipeline_id: String,
    pub interval: Interval,
    pub task_id: TaskId,
    pub state: TaskState,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<FailureKind>,
    #[serde(default)]
    pub metrics: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(pipeline_id: &str, interval: Interval, task_id: &str) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: pipeline_id.to_string(),
            interval,
            task_id: task_id.to_string(),
            state: TaskState::Pending,
            attempt: 0,
            last_error: None,
            error_kind: None,
            metrics: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Copia con el estado nuevo y `updated_at` al día. Los campos propios de
    /// cada transición los completa quien llama.
    pub fn with_state(&self, state: TaskState) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = Utc::now();
        next
    }

    fn key(&self) -> TaskKey {
        (self.pipeline_id.clone(), self.interval, self.task_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub pipeline_id: String,
    pub interval: Interval,
    pub status: RunStatus,
    pub trigger: Trigger,
    pub failed_task: Option<TaskId>,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn started(pipeline_id: &str, interval: Interval, trigger: Trigger) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            interval,
            status: RunStatus::Running,
            trigger,
            failed_task: None,
            last_error: None,
            failure_kind: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Una línea del historial de auditoría: cada transición de una tarea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub pipeline_id: String,
    pub interval: Interval,
    pub task_id: TaskId,
    pub from: Option<TaskState>,
    pub to: TaskState,
    pub attempt: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Almacén durable de estado de runs y tareas.
///
/// `compare_and_set` es la única forma de escribir una tarea: sólo aplica si
/// el estado actual coincide con `expected` (`None` = la tarea no existe).
/// Eso hace lineales las mutaciones de una misma tarea aunque varios runs
/// escriban a la vez.
pub trait StateStore: Send + Sync {
    fn get_task(
        &self,
        pipeline_id: &str,
        interval: &Interval,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError>;

    fn compare_and_set(
        &self,
        expected: Option<TaskState>,
        next: TaskRecord,
    ) -> Result<(), StoreError>;

    fn list_tasks(&self, pipeline_id: &str, interval: &Interval)
        -> Result<Vec<TaskRecord>, StoreError>;

    fn put_run(&self, run: RunRecord) -> Result<(), StoreError>;

    fn get_run(&self, pipeline_id: &str, interval: &Interval)
        -> Result<Option<RunRecord>, StoreError>;

    /// Runs del pipeline ordenados por intervalo.
    fn list_runs(&self, pipeline_id: &str) -> Result<Vec<RunRecord>, StoreError>;

    fn history(&self, pipeline_id: &str, interval: &Interval)
        -> Result<Vec<HistoryEntry>, StoreError>;
}

type TaskKey = (String, Interval, TaskId);
type RunKey = (String, Interval);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JournalEntry {
    Task(TaskRecord),
    Run(RunRecord),
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskKey, TaskRecord>,
    runs: HashMap<RunKey, RunRecord>,
    history: Vec<HistoryEntry>,
    journal: Option<File>,
}

impl Inner {
    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Task(rec) => {
                let from = self.tasks.get(&rec.key()).map(|r| r.state);
                self.history.push(HistoryEntry {
                    pipeline_id: rec.pipeline_id.clone(),
                    interval: rec.interval,
                    task_id: rec.task_id.clone(),
                    from,
                    to: rec.state,
                    attempt: rec.attempt,
                    error: rec.last_error.clone(),
                    at: rec.updated_at,
                });
                self.tasks.insert(rec.key(), rec);
            }
            JournalEntry::Run(run) => {
                self.runs
                    .insert((run.pipeline_id.clone(), run.interval), run);
            }
        }
    }

    /// Primero el journal, después la memoria: si el append falla el estado
    /// en memoria no cambia.
    fn persist(&mut self, entry: &JournalEntry) -> Result<(), StoreError> {
        if let Some(f) = self.journal.as_mut() {
            let mut line = serde_json::to_string(entry)?;
            line.push('\n');
            f.write_all(line.as_bytes())?;
            f.flush()?;
            f.sync_data()?;
        }
        Ok(())
    }
}

/// `StateStore` en memoria, opcionalmente respaldado por un journal JSON
/// Lines de sólo-append.
#[derive(Debug)]
pub struct JournalStore {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl JournalStore {
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path: None,
        }
    }

    /// Abre (o crea) el journal y lo reproduce para reconstruir el último
    /// estado y el historial.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut inner = Inner::default();
        let mut replayed = 0usize;

        // bytes hasta el final de la última línea buena
        let mut keep = 0usize;
        let mut truncated = false;
        let mut missing_newline = false;

        if path.exists() {
            let data = fs::read(&path)?;
            let chunks: Vec<&[u8]> = data.split_inclusive(|b| *b == b'\n').collect();
            let last = chunks.len().saturating_sub(1);

            for (i, chunk) in chunks.iter().copied().enumerate() {
                let end = keep + chunk.len();
                let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
                if line.iter().all(u8::is_ascii_whitespace) {
                    keep = end;
                    continue;
                }
                match serde_json::from_slice::<JournalEntry>(line) {
                    Ok(entry) => {
                        inner.apply(entry);
                        replayed += 1;
                        keep = end;
                        missing_newline = !chunk.ends_with(b"\n");
                    }
                    // una caída a mitad de append deja la última línea cortada
                    Err(e) if i == last => {
                        warn!(
                            "journal {}: descartando última línea incompleta ({} bytes): {}",
                            path.display(),
                            chunk.len(),
                            e
                        );
                        truncated = true;
                    }
                    Err(e) => return Err(StoreError::Codec(e)),
                }
            }

            // se corta el fragmento para que los appends no queden pegados a él
            if truncated {
                let f = OpenOptions::new().write(true).open(&path)?;
                f.set_len(keep as u64)?;
                f.sync_all()?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if missing_newline {
            // última entrada válida pero sin salto de línea
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        inner.journal = Some(file);

        info!(
            "journal {} abierto: {} entradas, {} tareas, {} runs",
            path.display(),
            replayed,
            inner.tasks.len(),
            inner.runs.len()
        );

        Ok(Self {
            inner: Mutex::new(inner),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn state_label(s: Option<TaskState>) -> String {
    s.map(|s| s.as_str().to_string())
        .unwrap_or_else(|| "<absent>".to_string())
}

impl StateStore for JournalStore {
    fn get_task(
        &self,
        pipeline_id: &str,
        interval: &Interval,
        task_id: &str,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let inner = self.lock()?;
        let key = (pipeline_id.to_string(), *interval, task_id.to_string());
        Ok(inner.tasks.get(&key).cloned())
    }

    fn compare_and_set(
        &self,
        expected: Option<TaskState>,
        next: TaskRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let key = next.key();
        let current = inner.tasks.get(&key).map(|r| r.state);

        if current != expected {
            return Err(StoreError::Conflict {
                key: format!("{}/{}/{}", key.0, key.1, key.2),
                expected: state_label(expected),
                found: state_label(current),
            });
        }

        debug!(
            "cas {}/{}/{}: {} -> {} (attempt={})",
            next.pipeline_id,
            next.interval,
            next.task_id,
            state_label(current),
            next.state,
            next.attempt
        );

        let entry = JournalEntry::Task(next);
        inner.persist(&entry)?;
        inner.apply(entry);
        Ok(())
    }

    fn list_tasks(
        &self,
        pipeline_id: &str,
        interval: &Interval,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<TaskRecord> = inner
            .tasks
            .values()
            .filter(|r| r.pipeline_id == pipeline_id && r.interval == *interval)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        Ok(out)
    }

    fn put_run(&self, run: RunRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let entry = JournalEntry::Run(run);
        inner.persist(&entry)?;
        inner.apply(entry);
        Ok(())
    }

    fn get_run(
        &self,
        pipeline_id: &str,
        interval: &Interval,
    ) -> Result<Option<RunRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .runs
            .get(&(pipeline_id.to_string(), *interval))
            .cloned())
    }

    fn list_runs(&self, pipeline_id: &str) -> Result<Vec<RunRecord>, StoreError> {
        let inner = self.lock()?;
        let mut out: Vec<RunRecord> = inner
            .runs
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.interval);
        Ok(out)
    }

    fn history(
        &self,
        pipeline_id: &str,
        interval: &Interval,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .history
            .iter()
            .filter(|h| h.pipeline_id == pipeline_id && h.interval == *interval)
            .cloned()
            .collect())
    }
}
