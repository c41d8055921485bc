use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dag::TaskGraph;
use crate::error::{FailureKind, RunnerError, StoreError, TaskError};
use crate::record::Interval;
use crate::state::{HistoryEntry, RunRecord, RunStatus, StateStore, TaskRecord, Trigger};
use crate::task::{RetryPolicy, TaskCallable, TaskContext, TaskId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Tareas del mismo run ejecutándose a la vez
    pub max_parallel: usize,
    /// Fallos permanentes que terminan el run
    pub max_failed_tasks: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_failed_tasks: 1,
        }
    }
}

type ActiveRuns = Arc<Mutex<HashMap<Interval, CancellationToken>>>;

/// Candado por intervalo. Mientras vive, ningún otro run del mismo intervalo
/// puede empezar; al soltarse libera el intervalo.
struct ActiveRun {
    active: ActiveRuns,
    interval: Interval,
    token: CancellationToken,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.interval);
        }
    }
}

/// Resultado final de una tarea tal como lo ve el bucle del run.
#[derive(Debug, Clone)]
struct TaskOutcome {
    task_id: TaskId,
    state: TaskState,
    error: Option<String>,
    kind: Option<FailureKind>,
}

impl TaskOutcome {
    fn from_record(rec: &TaskRecord) -> Self {
        Self {
            task_id: rec.task_id.clone(),
            state: rec.state,
            error: rec.last_error.clone(),
            kind: rec.error_kind,
        }
    }
}

/// Todo lo que necesita una tarea lanzada en segundo plano.
struct Attempt {
    pipeline_id: String,
    record: TaskRecord,
    retry: RetryPolicy,
    callable: Arc<dyn TaskCallable>,
    store: Arc<dyn StateStore>,
    cancel: CancellationToken,
}

/// Aplica una transición normal del ciclo de vida vía CAS.
fn transition(
    store: &dyn StateStore,
    current: &TaskRecord,
    next: TaskRecord,
) -> Result<TaskRecord, StoreError> {
    if !current.state.can_transition(next.state) {
        return Err(StoreError::InvalidTransition {
            task: current.task_id.clone(),
            from: current.state.to_string(),
            to: next.state.to_string(),
        });
    }
    store.compare_and_set(Some(current.state), next.clone())?;
    Ok(next)
}

/// Bucle de reintentos de una tarea: running → success | failed → retrying
/// → running ... hasta agotar intentos o cancelar.
async fn drive_attempts(job: Attempt) -> Result<TaskOutcome, StoreError> {
    let Attempt {
        pipeline_id,
        mut record,
        retry,
        callable,
        store,
        cancel,
    } = job;

    loop {
        let attempt = record.attempt + 1;
        let mut running = record.with_state(TaskState::Running);
        running.attempt = attempt;
        running.started_at = Some(Utc::now());
        running.finished_at = None;
        record = transition(store.as_ref(), &record, running)?;

        info!(
            "[{}/{}] tarea {} running (intento {}/{})",
            pipeline_id, record.interval, record.task_id, attempt, retry.max_attempts
        );

        let ctx = TaskContext {
            pipeline_id: pipeline_id.clone(),
            interval: record.interval,
            task_id: record.task_id.clone(),
            attempt,
            cancel: cancel.clone(),
        };

        // el callable puede tener trabajo bloqueante en curso: tras cancelar
        // se le espera igual para no soltar el intervalo con escrituras vivas
        let call = callable.call(&ctx);
        tokio::pin!(call);
        let result = tokio::select! {
            r = &mut call => r,
            _ = cancel.cancelled() => {
                debug!(
                    "[{}/{}] tarea {} cancelada, esperando a que se detenga",
                    pipeline_id, record.interval, record.task_id
                );
                match call.await {
                    Ok(output) => Ok(output),
                    Err(_) => Err(TaskError::Cancelled),
                }
            }
        };

        match result {
            Ok(output) => {
                let mut done = record.with_state(TaskState::Success);
                done.metrics = output.metrics;
                done.last_error = None;
                done.error_kind = None;
                done.finished_at = Some(Utc::now());
                record = transition(store.as_ref(), &record, done)?;

                info!(
                    "[{}/{}] tarea {} success (intento {})",
                    pipeline_id, record.interval, record.task_id, attempt
                );
                return Ok(TaskOutcome::from_record(&record));
            }
            Err(err) => {
                let mut failed = record.with_state(TaskState::Failed);
                failed.last_error = Some(err.to_string());
                failed.error_kind = Some(err.kind());
                failed.finished_at = Some(Utc::now());
                record = transition(store.as_ref(), &record, failed)?;

                let retryable = err.is_retryable()
                    && attempt < retry.max_attempts
                    && !cancel.is_cancelled();

                if !retryable {
                    warn!(
                        "[{}/{}] tarea {} failed definitivamente tras {} intento(s): {}",
                        pipeline_id, record.interval, record.task_id, attempt, err
                    );
                    return Ok(TaskOutcome::from_record(&record));
                }

                let wait = retry.backoff(attempt);
                record = transition(
                    store.as_ref(),
                    &record,
                    record.with_state(TaskState::Retrying),
                )?;
                warn!(
                    "[{}/{}] tarea {} failed (intento {}): {}; reintento en {:?}",
                    pipeline_id, record.interval, record.task_id, attempt, err, wait
                );

                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(wait) => false,
                    _ = cancel.cancelled() => true,
                };

                if interrupted {
                    let mut skipped = record.with_state(TaskState::Skipped);
                    skipped.last_error = Some(TaskError::Cancelled.to_string());
                    skipped.error_kind = Some(FailureKind::Cancelled);
                    skipped.finished_at = Some(Utc::now());
                    record = transition(store.as_ref(), &record, skipped)?;
                    return Ok(TaskOutcome::from_record(&record));
                }
            }
        }
    }
}

/// Corre la tarea en su propio spawn para que un pánico del callable quede
/// convertido en fallo de la tarea y no tumbe el run.
async fn run_task(job: Attempt) -> TaskOutcome {
    let task_id = job.record.task_id.clone();
    let pipeline_id = job.pipeline_id.clone();
    let interval = job.record.interval;
    let store = job.store.clone();

    let detail = match tokio::spawn(drive_attempts(job)).await {
        Ok(Ok(outcome)) => return outcome,
        Ok(Err(e)) => format!("state store error: {e}"),
        Err(e) => format!("task panicked: {e}"),
    };
    error!("[{}/{}] tarea {}: {}", pipeline_id, interval, task_id, detail);

    // si quedó en running la cerramos como failed
    if let Ok(Some(rec)) = store.get_task(&pipeline_id, &interval, &task_id) {
        if rec.state == TaskState::Running {
            let mut failed = rec.with_state(TaskState::Failed);
            failed.last_error = Some(detail.clone());
            failed.error_kind = Some(FailureKind::Other);
            failed.finished_at = Some(Utc::now());
            if let Err(e) = transition(store.as_ref(), &rec, failed) {
                error!("[{}/{}] tarea {}: no se pudo marcar failed: {}", pipeline_id, interval, task_id, e);
            }
        }
    }

    TaskOutcome {
        task_id,
        state: TaskState::Failed,
        error: Some(detail),
        kind: Some(FailureKind::Other),
    }
}

/// Estado del bucle de un run mientras hay tareas en vuelo.
struct DriveState {
    states: HashMap<TaskId, TaskState>,
    in_flight: usize,
    permanent_failures: usize,
    first_failure: Option<TaskOutcome>,
    halted: bool,
    cancel_seen: bool,
}

struct DriveSummary {
    states: HashMap<TaskId, TaskState>,
    first_failure: Option<TaskOutcome>,
    cancelled: bool,
}

/// Runner del grafo de tareas de un pipeline.
///
/// Cada run es (pipeline, intervalo). Runs de intervalos distintos son
/// independientes; dos runs del mismo intervalo nunca se solapan.
pub struct Runner {
    pipeline_id: String,
    graph: Arc<TaskGraph>,
    store: Arc<dyn StateStore>,
    config: RunnerConfig,
    active: ActiveRuns,
}

impl Runner {
    pub fn new(
        pipeline_id: &str,
        graph: TaskGraph,
        store: Arc<dyn StateStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            graph: Arc::new(graph),
            store,
            config: RunnerConfig {
                max_parallel: config.max_parallel.max(1),
                max_failed_tasks: config.max_failed_tasks.max(1),
            },
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn config(&self) -> RunnerConfig {
        self.config
    }

    /* ---------------- disparo de runs ---------------- */

    /// Ejecuta el grafo completo para `interval` y espera al final.
    ///
    /// Sin `force` las tareas ya en `success` no se repiten; con `force` todas
    /// vuelven a `pending`.
    pub async fn run(
        &self,
        interval: Interval,
        trigger: Trigger,
        force: bool,
    ) -> Result<RunRecord, RunnerError> {
        let guard = self.begin_run(interval, trigger, force)?;
        self.execute(guard).await
    }

    /// Como `run` pero en segundo plano. Los errores de arranque
    /// (`RunInProgress`, store) se devuelven aquí, antes del spawn.
    pub fn spawn_run(
        self: &Arc<Self>,
        interval: Interval,
        trigger: Trigger,
        force: bool,
    ) -> Result<JoinHandle<Result<RunRecord, RunnerError>>, RunnerError> {
        let guard = self.begin_run(interval, trigger, force)?;
        let runner = Arc::clone(self);
        Ok(tokio::spawn(async move { runner.execute(guard).await }))
    }

    /// Reinicia una tarea `failed` y retoma el run del intervalo.
    pub async fn retry_task(
        &self,
        interval: Interval,
        task_id: &str,
    ) -> Result<RunRecord, RunnerError> {
        let guard = self.begin_retry(interval, task_id)?;
        self.execute(guard).await
    }

    pub fn spawn_retry(
        self: &Arc<Self>,
        interval: Interval,
        task_id: &str,
    ) -> Result<JoinHandle<Result<RunRecord, RunnerError>>, RunnerError> {
        let guard = self.begin_retry(interval, task_id)?;
        let runner = Arc::clone(self);
        Ok(tokio::spawn(async move { runner.execute(guard).await }))
    }

    /// Pide la cancelación del run en curso del intervalo.
    pub fn cancel(&self, interval: &Interval) -> Result<(), RunnerError> {
        let active = self
            .active
            .lock()
            .map_err(|_| RunnerError::Store(StoreError::Poisoned))?;
        match active.get(interval) {
            Some(token) => {
                info!("[{}/{}] cancelación solicitada", self.pipeline_id, interval);
                token.cancel();
                Ok(())
            }
            None => Err(RunnerError::NotRunning(interval.to_string())),
        }
    }

    pub fn is_active(&self, interval: &Interval) -> bool {
        self.active
            .lock()
            .map(|a| a.contains_key(interval))
            .unwrap_or(false)
    }

    /* ---------------- consultas ---------------- */

    pub fn status(&self, interval: &Interval) -> Result<Option<RunRecord>, RunnerError> {
        Ok(self.store.get_run(&self.pipeline_id, interval)?)
    }

    /// Registros de tareas del intervalo en orden topológico.
    pub fn tasks(&self, interval: &Interval) -> Result<Vec<TaskRecord>, RunnerError> {
        let mut recs = self.store.list_tasks(&self.pipeline_id, interval)?;
        let pos: HashMap<&str, usize> = self
            .graph
            .topo_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        recs.sort_by_key(|r| pos.get(r.task_id.as_str()).copied().unwrap_or(usize::MAX));
        Ok(recs)
    }

    pub fn history(&self, interval: &Interval) -> Result<Vec<HistoryEntry>, RunnerError> {
        Ok(self.store.history(&self.pipeline_id, interval)?)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>, RunnerError> {
        Ok(self.store.list_runs(&self.pipeline_id)?)
    }

    /// Runs que el store tiene como `running` pero que este proceso no está
    /// ejecutando: quedaron a medias por una caída.
    pub fn interrupted_runs(&self) -> Result<Vec<Interval>, RunnerError> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|r| r.status == RunStatus::Running && !self.is_active(&r.interval))
            .map(|r| r.interval)
            .collect())
    }

    /* ---------------- preparación ---------------- */

    fn acquire(&self, interval: Interval) -> Result<ActiveRun, RunnerError> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| RunnerError::Store(StoreError::Poisoned))?;
        if active.contains_key(&interval) {
            return Err(RunnerError::RunInProgress(interval.to_string()));
        }
        let token = CancellationToken::new();
        active.insert(interval, token.clone());
        Ok(ActiveRun {
            active: self.active.clone(),
            interval,
            token,
        })
    }

    fn begin_run(
        &self,
        interval: Interval,
        trigger: Trigger,
        force: bool,
    ) -> Result<ActiveRun, RunnerError> {
        let guard = self.acquire(interval)?;
        self.prepare_tasks(&interval, force)?;
        self.store
            .put_run(RunRecord::started(&self.pipeline_id, interval, trigger))?;
        info!(
            "[{}/{}] run iniciado (trigger={:?}, force={})",
            self.pipeline_id, interval, trigger, force
        );
        Ok(guard)
    }

    fn begin_retry(&self, interval: Interval, task_id: &str) -> Result<ActiveRun, RunnerError> {
        if !self.graph.contains(task_id) {
            return Err(RunnerError::UnknownTask(task_id.to_string()));
        }
        let guard = self.acquire(interval)?;

        let rec = self
            .store
            .get_task(&self.pipeline_id, &interval, task_id)?
            .ok_or_else(|| RunnerError::UnknownRun(interval.to_string()))?;
        if rec.state != TaskState::Failed {
            return Err(RunnerError::NotRetryable {
                task: task_id.to_string(),
                state: rec.state.to_string(),
            });
        }

        self.reset(&rec, false)?;
        for d in self.graph.descendants(task_id) {
            if let Some(r) = self.store.get_task(&self.pipeline_id, &interval, &d)? {
                if matches!(r.state, TaskState::UpstreamFailed | TaskState::Skipped) {
                    self.reset(&r, false)?;
                }
            }
        }
        // lo que quedó sin arrancar por el corte del run también vuelve
        for r in self.store.list_tasks(&self.pipeline_id, &interval)? {
            if r.state == TaskState::Skipped {
                self.reset(&r, false)?;
            }
        }

        self.store
            .put_run(RunRecord::started(&self.pipeline_id, interval, Trigger::Retry))?;
        info!(
            "[{}/{}] reintento manual de la tarea {}",
            self.pipeline_id, interval, task_id
        );
        Ok(guard)
    }

    /// Deja cada tarea del grafo lista para el run:
    /// - nueva → se crea en `pending`
    /// - `success` → se conserva salvo `force`
    /// - `running`/`retrying` (caída del proceso) → `pending` con su contador
    /// - el resto → `pending` desde cero
    fn prepare_tasks(&self, interval: &Interval, force: bool) -> Result<(), RunnerError> {
        for id in self.graph.topo_order() {
            match self.store.get_task(&self.pipeline_id, interval, id)? {
                None => {
                    self.store
                        .compare_and_set(None, TaskRecord::new(&self.pipeline_id, *interval, id))?;
                }
                Some(rec) if force => self.reset(&rec, false)?,
                Some(rec) => match rec.state {
                    TaskState::Success | TaskState::Pending => {}
                    TaskState::Running | TaskState::Retrying => {
                        warn!(
                            "[{}/{}] tarea {} estaba {} (proceso interrumpido), vuelve a pending",
                            self.pipeline_id, interval, id, rec.state
                        );
                        self.reset(&rec, true)?;
                    }
                    TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped => {
                        self.reset(&rec, false)?
                    }
                },
            }
        }
        Ok(())
    }

    /// Vuelta manual a `pending`; no pasa por `can_transition`.
    fn reset(&self, rec: &TaskRecord, keep_attempt: bool) -> Result<(), StoreError> {
        let attempt = if keep_attempt { rec.attempt } else { 0 };
        if rec.state == TaskState::Pending && rec.attempt == attempt {
            return Ok(());
        }
        let mut next = rec.with_state(TaskState::Pending);
        next.attempt = attempt;
        next.last_error = None;
        next.error_kind = None;
        next.started_at = None;
        next.finished_at = None;
        if !keep_attempt {
            next.metrics.clear();
        }
        self.store.compare_and_set(Some(rec.state), next)
    }

    /* ---------------- ejecución ---------------- */

    async fn execute(&self, guard: ActiveRun) -> Result<RunRecord, RunnerError> {
        let interval = guard.interval;

        let summary = match self.drive(interval, &guard.token).await {
            Ok(s) => s,
            Err(e) => {
                error!("[{}/{}] run abortado: {}", self.pipeline_id, interval, e);
                self.mark_aborted(&interval, &e);
                return Err(e);
            }
        };

        let run = self.finish_run(interval, summary)?;
        drop(guard);
        Ok(run)
    }

    /// Deja el run en `failed` tras un error interno. Si tampoco se puede
    /// escribir, queda en el log y el run sigue como `running` hasta el
    /// próximo arranque.
    fn mark_aborted(&self, interval: &Interval, cause: &RunnerError) {
        let mut run = match self.store.get_run(&self.pipeline_id, interval) {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                error!(
                    "[{}/{}] no se pudo leer el run abortado: {}",
                    self.pipeline_id, interval, e
                );
                return;
            }
        };
        run.status = RunStatus::Failed;
        run.last_error = Some(cause.to_string());
        run.failure_kind = Some(FailureKind::Other);
        run.finished_at = Some(Utc::now());
        if let Err(e) = self.store.put_run(run) {
            error!(
                "[{}/{}] no se pudo marcar el run como failed: {}",
                self.pipeline_id, interval, e
            );
        }
    }

    async fn drive(
        &self,
        interval: Interval,
        cancel: &CancellationToken,
    ) -> Result<DriveSummary, RunnerError> {
        let states: HashMap<TaskId, TaskState> = self
            .store
            .list_tasks(&self.pipeline_id, &interval)?
            .into_iter()
            .map(|r| (r.task_id, r.state))
            .collect();

        // hijo del token del run: un error interno corta las tareas sin
        // marcar el run como cancelado
        let abort = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskOutcome>();
        let mut st = DriveState {
            states,
            in_flight: 0,
            permanent_failures: 0,
            first_failure: None,
            halted: false,
            cancel_seen: false,
        };

        match self
            .drive_loop(interval, cancel, &abort, &tx, &mut rx, &mut st)
            .await
        {
            Ok(()) => Ok(DriveSummary {
                states: st.states,
                first_failure: st.first_failure,
                cancelled: st.cancel_seen || cancel.is_cancelled(),
            }),
            Err(e) => {
                abort.cancel();
                drop(tx);
                if st.in_flight > 0 {
                    warn!(
                        "[{}/{}] esperando a {} tarea(s) en vuelo antes de abortar",
                        self.pipeline_id, interval, st.in_flight
                    );
                }
                while st.in_flight > 0 {
                    if rx.recv().await.is_none() {
                        break;
                    }
                    st.in_flight -= 1;
                }
                Err(e)
            }
        }
    }

    async fn drive_loop(
        &self,
        interval: Interval,
        cancel: &CancellationToken,
        abort: &CancellationToken,
        tx: &mpsc::UnboundedSender<TaskOutcome>,
        rx: &mut mpsc::UnboundedReceiver<TaskOutcome>,
        st: &mut DriveState,
    ) -> Result<(), RunnerError> {
        loop {
            if cancel.is_cancelled() && !st.cancel_seen {
                st.cancel_seen = true;
                self.skip_pending(&interval, &mut st.states, Some(FailureKind::Cancelled))?;
            }

            if !st.halted && !st.cancel_seen {
                for id in self.graph.topo_order() {
                    if st.in_flight >= self.config.max_parallel {
                        break;
                    }
                    if st.states.get(id) != Some(&TaskState::Pending) {
                        continue;
                    }
                    let ready = self
                        .graph
                        .upstream(id)
                        .iter()
                        .all(|d| st.states.get(d) == Some(&TaskState::Success));
                    if !ready {
                        continue;
                    }

                    let (Some(spec), Some(record)) = (
                        self.graph.get(id),
                        self.store.get_task(&self.pipeline_id, &interval, id)?,
                    ) else {
                        continue;
                    };

                    st.states.insert(id.clone(), TaskState::Running);
                    st.in_flight += 1;

                    let job = Attempt {
                        pipeline_id: self.pipeline_id.clone(),
                        record,
                        retry: spec.retry,
                        callable: spec.callable.clone(),
                        store: self.store.clone(),
                        cancel: abort.child_token(),
                    };
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let outcome = run_task(job).await;
                        let _ = tx.send(outcome);
                    });
                }
            }

            if st.in_flight == 0 {
                return Ok(());
            }

            tokio::select! {
                Some(outcome) = rx.recv() => {
                    st.in_flight -= 1;
                    st.states.insert(outcome.task_id.clone(), outcome.state);
                    debug!(
                        "[{}/{}] tarea {} terminó en {} ({} en vuelo)",
                        self.pipeline_id, interval, outcome.task_id, outcome.state, st.in_flight
                    );

                    if outcome.state == TaskState::Failed {
                        st.permanent_failures += 1;
                        self.mark_upstream_failed(&interval, &outcome.task_id, &mut st.states)?;

                        if st.first_failure.is_none() {
                            st.first_failure = Some(outcome);
                        }
                        if !st.halted && st.permanent_failures >= self.config.max_failed_tasks {
                            st.halted = true;
                            warn!(
                                "[{}/{}] {} tarea(s) fallidas, no se lanzan más tareas",
                                self.pipeline_id, interval, st.permanent_failures
                            );
                            self.skip_pending(&interval, &mut st.states, None)?;
                        }
                    }
                }
                _ = cancel.cancelled(), if !st.cancel_seen => {
                    st.cancel_seen = true;
                    warn!(
                        "[{}/{}] run cancelado con {} tarea(s) en vuelo",
                        self.pipeline_id, interval, st.in_flight
                    );
                    self.skip_pending(&interval, &mut st.states, Some(FailureKind::Cancelled))?;
                }
                else => return Ok(()),
            }
        }
    }

    fn mark_upstream_failed(
        &self,
        interval: &Interval,
        failed: &str,
        states: &mut HashMap<TaskId, TaskState>,
    ) -> Result<(), RunnerError> {
        let reason = TaskError::UpstreamFailed(failed.to_string());

        for d in self.graph.descendants(failed) {
            if states.get(&d) != Some(&TaskState::Pending) {
                continue;
            }
            if let Some(rec) = self.store.get_task(&self.pipeline_id, interval, &d)? {
                let mut next = rec.with_state(TaskState::UpstreamFailed);
                next.last_error = Some(reason.to_string());
                next.error_kind = Some(reason.kind());
                next.finished_at = Some(Utc::now());
                transition(self.store.as_ref(), &rec, next)?;
                states.insert(d.clone(), TaskState::UpstreamFailed);
                info!(
                    "[{}/{}] tarea {} upstream_failed (por {})",
                    self.pipeline_id, interval, d, failed
                );
            }
        }
        Ok(())
    }

    fn skip_pending(
        &self,
        interval: &Interval,
        states: &mut HashMap<TaskId, TaskState>,
        kind: Option<FailureKind>,
    ) -> Result<(), RunnerError> {
        for id in self.graph.topo_order() {
            if states.get(id) != Some(&TaskState::Pending) {
                continue;
            }
            if let Some(rec) = self.store.get_task(&self.pipeline_id, interval, id)? {
                let mut next = rec.with_state(TaskState::Skipped);
                next.error_kind = kind;
                next.finished_at = Some(Utc::now());
                transition(self.store.as_ref(), &rec, next)?;
                states.insert(id.clone(), TaskState::Skipped);
                debug!("[{}/{}] tarea {} skipped", self.pipeline_id, interval, id);
            }
        }
        Ok(())
    }

    fn finish_run(
        &self,
        interval: Interval,
        summary: DriveSummary,
    ) -> Result<RunRecord, RunnerError> {
        let mut run = self
            .store
            .get_run(&self.pipeline_id, &interval)?
            .unwrap_or_else(|| RunRecord::started(&self.pipeline_id, interval, Trigger::Manual));

        let all_ok = self
            .graph
            .topo_order()
            .iter()
            .all(|id| summary.states.get(id) == Some(&TaskState::Success));

        run.finished_at = Some(Utc::now());
        run.failed_task = summary.first_failure.as_ref().map(|f| f.task_id.clone());
        run.last_error = summary.first_failure.as_ref().and_then(|f| f.error.clone());
        run.failure_kind = summary.first_failure.as_ref().and_then(|f| f.kind);

        if summary.cancelled && !all_ok {
            run.status = RunStatus::Cancelled;
            run.failure_kind = Some(FailureKind::Cancelled);
            if run.last_error.is_none() {
                run.last_error = Some(TaskError::Cancelled.to_string());
            }
        } else if all_ok {
            run.status = RunStatus::Success;
            run.failed_task = None;
            run.last_error = None;
            run.failure_kind = None;
        } else {
            run.status = RunStatus::Failed;
            if run.failure_kind.is_none() {
                run.failure_kind = Some(FailureKind::Other);
                run.last_error = Some("run ended with tasks not completed".to_string());
            }
        }

        self.store.put_run(run.clone())?;

        match run.status {
            RunStatus::Success => info!("[{}/{}] run success", self.pipeline_id, interval),
            status => warn!(
                "[{}/{}] run {:?}: tarea={:?} error={:?}",
                self.pipeline_id, interval, status, run.failed_task, run.last_error
            ),
        }
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::GraphBuilder;
    use crate::error::{SourceError, WriteError};
    use crate::state::JournalStore;
    use crate::task::{FnTask, TaskOutput};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn day() -> Interval {
        "2023-01-01".parse().unwrap()
    }

    fn counting_ok(calls: Arc<AtomicUsize>) -> Arc<dyn TaskCallable> {
        Arc::new(FnTask(move |_ctx: TaskContext| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TaskError>(TaskOutput::default().metric("rows", 1))
            }
        }))
    }

    fn always_fails() -> Arc<dyn TaskCallable> {
        Arc::new(FnTask(|_ctx: TaskContext| async {
            Err::<TaskOutput, _>(TaskError::Source(SourceError::Unavailable(
                "origen caído".into(),
            )))
        }))
    }

    /// Espera a que lo cancelen; nunca termina por sí sola.
    fn blocks_until_cancelled(started: Arc<AtomicBool>) -> Arc<dyn TaskCallable> {
        Arc::new(FnTask(move |ctx: TaskContext| {
            let started = started.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                ctx.cancel.cancelled().await;
                Err::<TaskOutput, _>(TaskError::Cancelled)
            }
        }))
    }

    fn etl_runner(
        extract: Arc<dyn TaskCallable>,
        transform: Arc<dyn TaskCallable>,
        load: Arc<dyn TaskCallable>,
        store: Arc<dyn StateStore>,
    ) -> Runner {
        let graph = GraphBuilder::new()
            .with_default_retry(RetryPolicy::no_backoff(3))
            .task("extract", &[], extract)
            .task("transform", &["extract"], transform)
            .task("load", &["transform"], load)
            .build()
            .unwrap();
        Runner::new("orders", graph, store, RunnerConfig::default())
    }

    async fn wait_for(flag: &AtomicBool) {
        for _ in 0..200 {
            if flag.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("la tarea nunca arrancó");
    }

    #[tokio::test]
    async fn load_falla_dos_veces_y_luego_pasa() {
        let load_calls = Arc::new(AtomicUsize::new(0));
        let calls = load_calls.clone();
        let load: Arc<dyn TaskCallable> = Arc::new(FnTask(move |_ctx: TaskContext| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TaskError::Write(WriteError::Encode("disco lleno".into())))
                } else {
                    Ok(TaskOutput::default())
                }
            }
        }));

        let store: Arc<dyn StateStore> = Arc::new(JournalStore::in_memory());
        let noop = Arc::new(AtomicUsize::new(0));
        let runner = etl_runner(counting_ok(noop.clone()), counting_ok(noop), load, store);

        let run = runner.run(day(), Trigger::Manual, false).await.unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(load_calls.load(Ordering::SeqCst), 3);

        let load_hist: Vec<TaskState> = runner
            .history(&day())
            .unwrap()
            .into_iter()
            .filter(|h| h.task_id == "load")
            .map(|h| h.to)
            .collect();
        use TaskState::*;
        assert_eq!(
            load_hist,
            vec![Pending, Running, Failed, Retrying, Running, Failed, Retrying, Running, Success]
        );

        let tasks = runner.tasks(&day()).unwrap();
        let load_rec = tasks.iter().find(|t| t.task_id == "load").unwrap();
        assert_eq!(load_rec.attempt, 3);
        assert!(load_rec.last_error.is_none());
    }

    #[tokio::test]
    async fn transform_agota_reintentos_y_load_nunca_corre() {
        let load_calls = Arc::new(AtomicUsize::new(0));
        let store: Arc<dyn StateStore> = Arc::new(JournalStore::in_memory());
        let runner = etl_runner(
            counting_ok(Arc::new(AtomicUsize::new(0))),
            always_fails(),
            counting_ok(load_calls.clone()),
            store,
        );

        let run = runner.run(day(), Trigger::Manual, false).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_task.as_deref(), Some("transform"));
        assert_eq!(run.failure_kind, Some(FailureKind::SourceUnavailable));
        assert!(run.last_error.unwrap().contains("origen caído"));
        assert_eq!(load_calls.load(Ordering::SeqCst), 0);

        let tasks = runner.tasks(&day()).unwrap();
        let names: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(names, vec!["extract", "transform", "load"]);
        assert_eq!(tasks[1].state, TaskState::Failed);
        assert_eq!(tasks[1].attempt, 3);
        assert_eq!(tasks[2].state, TaskState::UpstreamFailed);
        assert_eq!(tasks[2].error_kind, Some(FailureKind::UpstreamFailed));

        let load_never_ran = runner
            .history(&day())
            .unwrap()
            .iter()
            .filter(|h| h.task_id == "load")
            .all(|h| matches!(h.to, TaskState::Pending | TaskState::UpstreamFailed));
        assert!(load_never_ran);
    }

    #[tokio::test]
    async fn dependiente_no_arranca_antes_que_sus_dependencias() {
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let logged = |name: &'static str, ms: u64, log: Arc<Mutex<Vec<String>>>| -> Arc<dyn TaskCallable> {
            Arc::new(FnTask(move |_ctx: TaskContext| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("start:{name}"));
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    log.lock().unwrap().push(format!("end:{name}"));
                    Ok::<_, TaskError>(TaskOutput::default())
                }
            }))
        };

        let graph = GraphBuilder::new()
            .task("a", &[], logged("a", 30, log.clone()))
            .task("b", &[], logged("b", 5, log.clone()))
            .task("c", &["a", "b"], logged("c", 1, log.clone()))
            .build()
            .unwrap();
        let runner = Runner::new(
            "p",
            graph,
            Arc::new(JournalStore::in_memory()),
            RunnerConfig::default(),
        );

        let run = runner.run(day(), Trigger::Manual, false).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);

        let log = log.lock().unwrap().clone();
        let pos = |s: &str| log.iter().position(|x| x == s).unwrap();
        assert!(pos("start:c") > pos("end:a"));
        assert!(pos("start:c") > pos("end:b"));
        // a y b son independientes: b arranca sin esperar a que termine a
        assert!(pos("start:b") < pos("end:a"));
    }

    #[tokio::test]
    async fn independientes_corren_en_paralelo() {
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let meet = |barrier: Arc<tokio::sync::Barrier>| -> Arc<dyn TaskCallable> {
            Arc::new(FnTask(move |_ctx: TaskContext| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok::<_, TaskError>(TaskOutput::default())
                }
            }))
        };

        let graph = GraphBuilder::new()
            .task("left", &[], meet(barrier.clone()))
            .task("right", &[], meet(barrier.clone()))
            .build()
            .unwrap();
        let runner = Runner::new(
            "p",
            graph,
            Arc::new(JournalStore::in_memory()),
            RunnerConfig::default(),
        );

        let run = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(day(), Trigger::Manual, false),
        )
        .await
        .expect("las dos tareas deberían encontrarse en la barrera")
        .unwrap();
        assert_eq!(run.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn cancelar_marca_en_vuelo_failed_y_pendientes_skipped() {
        let started = Arc::new(AtomicBool::new(false));
        let store: Arc<dyn StateStore> = Arc::new(JournalStore::in_memory());
        let runner = Arc::new(etl_runner(
            counting_ok(Arc::new(AtomicUsize::new(0))),
            blocks_until_cancelled(started.clone()),
            counting_ok(Arc::new(AtomicUsize::new(0))),
            store,
        ));

        let handle = runner.spawn_run(day(), Trigger::Manual, false).unwrap();
        wait_for(&started).await;
        assert!(runner.is_active(&day()));
        runner.cancel(&day()).unwrap();

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.failure_kind, Some(FailureKind::Cancelled));

        let tasks = runner.tasks(&day()).unwrap();
        assert_eq!(tasks[0].state, TaskState::Success);
        assert_eq!(tasks[1].state, TaskState::Failed);
        assert_eq!(tasks[1].error_kind, Some(FailureKind::Cancelled));
        assert_eq!(tasks[1].attempt, 1);
        assert_eq!(tasks[2].state, TaskState::Skipped);

        assert!(!runner.is_active(&day()));
        assert!(matches!(
            runner.cancel(&day()),
            Err(RunnerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn segundo_run_del_mismo_intervalo_se_rechaza() {
        let started = Arc::new(AtomicBool::new(false));
        let graph = GraphBuilder::new()
            .task("slow", &[], blocks_until_cancelled(started.clone()))
            .build()
            .unwrap();
        let runner = Arc::new(Runner::new(
            "p",
            graph,
            Arc::new(JournalStore::in_memory()),
            RunnerConfig::default(),
        ));

        let handle = runner.spawn_run(day(), Trigger::Manual, false).unwrap();
        wait_for(&started).await;

        let again = runner.run(day(), Trigger::Manual, true).await;
        assert!(matches!(again, Err(RunnerError::RunInProgress(_))));

        // otro intervalo no se ve afectado
        let other: Interval = "2023-01-02".parse().unwrap();
        assert!(runner.spawn_run(other, Trigger::Manual, false).is_ok());

        runner.cancel(&day()).unwrap();
        runner.cancel(&other).unwrap();
        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn reinicio_retoma_sin_repetir_las_exitosas() {
        let store: Arc<dyn StateStore> = Arc::new(JournalStore::in_memory());

        // estado que dejó un proceso caído: extract ok, transform a medias
        let extract = TaskRecord::new("orders", day(), "extract");
        store.compare_and_set(None, extract.clone()).unwrap();
        store
            .compare_and_set(Some(TaskState::Pending), extract.with_state(TaskState::Success))
            .unwrap();
        let transform = TaskRecord::new("orders", day(), "transform");
        store.compare_and_set(None, transform.clone()).unwrap();
        let mut running = transform.with_state(TaskState::Running);
        running.attempt = 1;
        store
            .compare_and_set(Some(TaskState::Pending), running)
            .unwrap();
        store
            .put_run(RunRecord::started("orders", day(), Trigger::Scheduled))
            .unwrap();

        let extract_calls = Arc::new(AtomicUsize::new(0));
        let transform_calls = Arc::new(AtomicUsize::new(0));
        let runner = etl_runner(
            counting_ok(extract_calls.clone()),
            counting_ok(transform_calls.clone()),
            counting_ok(Arc::new(AtomicUsize::new(0))),
            store,
        );

        assert_eq!(runner.interrupted_runs().unwrap(), vec![day()]);

        let run = runner.run(day(), Trigger::Scheduled, false).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(extract_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transform_calls.load(Ordering::SeqCst), 1);

        let tasks = runner.tasks(&day()).unwrap();
        // el intento interrumpido cuenta
        assert_eq!(tasks[1].attempt, 2);
        assert!(runner.interrupted_runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerun_sin_force_no_repite_y_con_force_si() {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = etl_runner(
            counting_ok(calls.clone()),
            counting_ok(calls.clone()),
            counting_ok(calls.clone()),
            Arc::new(JournalStore::in_memory()),
        );

        runner.run(day(), Trigger::Manual, false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let again = runner.run(day(), Trigger::Scheduled, false).await.unwrap();
        assert_eq!(again.status, RunStatus::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        runner.run(day(), Trigger::Manual, true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        let tasks = runner.tasks(&day()).unwrap();
        assert!(tasks.iter().all(|t| t.attempt == 1 && t.metrics["rows"] == 1));
    }

    #[tokio::test]
    async fn retry_task_reanuda_desde_la_fallida() {
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        let transform: Arc<dyn TaskCallable> = Arc::new(FnTask(move |_ctx: TaskContext| {
            let flag = flag.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    Ok(TaskOutput::default())
                } else {
                    Err(TaskError::Other("regla rota".into()))
                }
            }
        }));

        let extract_calls = Arc::new(AtomicUsize::new(0));
        let load_calls = Arc::new(AtomicUsize::new(0));
        let runner = etl_runner(
            counting_ok(extract_calls.clone()),
            transform,
            counting_ok(load_calls.clone()),
            Arc::new(JournalStore::in_memory()),
        );

        let run = runner.run(day(), Trigger::Manual, false).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);

        assert!(matches!(
            runner.retry_task(day(), "extract").await,
            Err(RunnerError::NotRetryable { .. })
        ));
        assert!(matches!(
            runner.retry_task(day(), "ghost").await,
            Err(RunnerError::UnknownTask(_))
        ));

        healthy.store(true, Ordering::SeqCst);
        let run = runner.retry_task(day(), "transform").await.unwrap();

        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.trigger, Trigger::Retry);
        assert_eq!(extract_calls.load(Ordering::SeqCst), 1);
        assert_eq!(load_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.tasks(&day()).unwrap()[1].attempt, 1);
    }

    #[tokio::test]
    async fn umbral_de_fallos_corta_el_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let graph = GraphBuilder::new()
            .with_default_retry(RetryPolicy::no_backoff(1))
            .task("a", &[], always_fails())
            .task("b", &[], counting_ok(calls.clone()))
            .task("c", &[], counting_ok(calls.clone()))
            .build()
            .unwrap();
        let runner = Runner::new(
            "p",
            graph,
            Arc::new(JournalStore::in_memory()),
            RunnerConfig {
                max_parallel: 1,
                max_failed_tasks: 1,
            },
        );

        let run = runner.run(day(), Trigger::Manual, false).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failed_task.as_deref(), Some("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let states: Vec<TaskState> = runner.tasks(&day()).unwrap().iter().map(|t| t.state).collect();
        assert_eq!(
            states,
            vec![TaskState::Failed, TaskState::Skipped, TaskState::Skipped]
        );
    }

    #[tokio::test]
    async fn backoff_se_interrumpe_al_cancelar() {
        let graph = GraphBuilder::new()
            .task_with_retry(
                "flaky",
                &[],
                RetryPolicy {
                    max_attempts: 3,
                    initial_backoff_ms: 60_000,
                    multiplier: 1.0,
                    max_backoff_ms: 60_000,
                },
                always_fails(),
            )
            .build()
            .unwrap();
        let runner = Arc::new(Runner::new(
            "p",
            graph,
            Arc::new(JournalStore::in_memory()),
            RunnerConfig::default(),
        ));

        let handle = runner.spawn_run(day(), Trigger::Manual, false).unwrap();
        for _ in 0..200 {
            let state = runner.tasks(&day()).unwrap()[0].state;
            if state == TaskState::Retrying {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        runner.cancel(&day()).unwrap();

        let run = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("el backoff debería cortarse")
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(runner.tasks(&day()).unwrap()[0].state, TaskState::Skipped);
    }

    /// Store que falla al marcar `upstream_failed`; el resto pasa al interior.
    struct FailingStore(JournalStore);

    impl StateStore for FailingStore {
        fn get_task(
            &self,
            pipeline_id: &str,
            interval: &Interval,
            task_id: &str,
        ) -> Result<Option<TaskRecord>, StoreError> {
            self.0.get_task(pipeline_id, interval, task_id)
        }

        fn compare_and_set(
            &self,
            expected: Option<TaskState>,
            next: TaskRecord,
        ) -> Result<(), StoreError> {
            if next.state == TaskState::UpstreamFailed {
                return Err(StoreError::Io(std::io::Error::other("disco lleno")));
            }
            self.0.compare_and_set(expected, next)
        }

        fn list_tasks(
            &self,
            pipeline_id: &str,
            interval: &Interval,
        ) -> Result<Vec<TaskRecord>, StoreError> {
            self.0.list_tasks(pipeline_id, interval)
        }

        fn put_run(&self, run: RunRecord) -> Result<(), StoreError> {
            self.0.put_run(run)
        }

        fn get_run(
            &self,
            pipeline_id: &str,
            interval: &Interval,
        ) -> Result<Option<RunRecord>, StoreError> {
            self.0.get_run(pipeline_id, interval)
        }

        fn list_runs(&self, pipeline_id: &str) -> Result<Vec<RunRecord>, StoreError> {
            self.0.list_runs(pipeline_id)
        }

        fn history(
            &self,
            pipeline_id: &str,
            interval: &Interval,
        ) -> Result<Vec<HistoryEntry>, StoreError> {
            self.0.history(pipeline_id, interval)
        }
    }

    #[tokio::test]
    async fn error_del_store_espera_a_las_tareas_en_vuelo() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let slow: Arc<dyn TaskCallable> = Arc::new(FnTask(move |ctx: TaskContext| {
            let flag = flag.clone();
            async move {
                ctx.cancel.cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
                Err::<TaskOutput, _>(TaskError::Cancelled)
            }
        }));

        let graph = GraphBuilder::new()
            .with_default_retry(RetryPolicy::no_backoff(1))
            .task("a", &[], always_fails())
            .task("b", &[], slow)
            .task("c", &["a"], counting_ok(Arc::new(AtomicUsize::new(0))))
            .build()
            .unwrap();
        let store: Arc<dyn StateStore> = Arc::new(FailingStore(JournalStore::in_memory()));
        let runner = Runner::new("p", graph, store, RunnerConfig::default());

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run(day(), Trigger::Manual, false),
        )
        .await
        .expect("el run debería abortar")
        .unwrap_err();

        assert!(matches!(err, RunnerError::Store(StoreError::Io(_))));
        // b terminó antes de que el run devolviera el error
        assert!(finished.load(Ordering::SeqCst));
        assert!(!runner.is_active(&day()));

        let run = runner.status(&day()).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure_kind, Some(FailureKind::Other));
        let b = runner
            .tasks(&day())
            .unwrap()
            .into_iter()
            .find(|t| t.task_id == "b")
            .unwrap();
        assert_eq!(b.state, TaskState::Failed);
        assert_eq!(b.error_kind, Some(FailureKind::Cancelled));
    }

    #[test]
    fn transicion_invalida_se_rechaza_sin_tocar_el_store() {
        let store = JournalStore::in_memory();
        let rec = TaskRecord::new("p", day(), "a");
        store.compare_and_set(None, rec.clone()).unwrap();
        let rec = transition(&store, &rec, rec.with_state(TaskState::Running)).unwrap();
        let rec = transition(&store, &rec, rec.with_state(TaskState::Success)).unwrap();
        let before = store.history("p", &day()).unwrap().len();

        let err = transition(&store, &rec, rec.with_state(TaskState::Running)).unwrap_err();

        assert!(matches!(
            err,
            StoreError::InvalidTransition { ref from, ref to, .. }
                if from == "success" && to == "running"
        ));
        let stored = store.get_task("p", &day(), "a").unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Success);
        assert_eq!(store.history("p", &day()).unwrap().len(), before);
    }
}
