use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::cleaner::{Cleaner, RejectReason};
use crate::dag::GraphBuilder;
use crate::error::{TaskError, WriteError};
use crate::record::{Batch, Interval, RawRecord, Record, Schema};
use crate::sink::{SinkWriter, WriteMode};
use crate::source::RecordSource;
use crate::task::{RetryPolicy, TaskCallable, TaskContext, TaskOutput};
use crate::transform::Transformer;

pub const EXTRACT: &str = "extract";
pub const TRANSFORM: &str = "transform";
pub const LOAD: &str = "load";

pub const RAW_ARTIFACT: &str = "raw.jsonl";
pub const REJECTS_ARTIFACT: &str = "rejects.jsonl";
pub const TRANSFORMED_ARTIFACT: &str = "transformed.jsonl";

/// Cada cuántas filas se mira el token de cancelación en los bucles largos.
const CANCEL_CHECK_EVERY: usize = 1_024;

/* =========================
   Artefactos intermedios
   ========================= */

/// Archivos JSONL que pasan datos de una tarea a la siguiente:
/// `<root>/<pipeline>/<intervalo>/<nombre>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, pipeline_id: &str, interval: &Interval, name: &str) -> PathBuf {
        self.root
            .join(pipeline_id)
            .join(interval.to_string())
            .join(name)
    }

    /// Escritor que publica el archivo sólo al hacer `commit`.
    pub fn writer(
        &self,
        pipeline_id: &str,
        interval: &Interval,
        name: &str,
    ) -> Result<JsonlWriter, TaskError> {
        JsonlWriter::create(self.path(pipeline_id, interval, name))
    }

    pub fn write_jsonl<T, I>(
        &self,
        pipeline_id: &str,
        interval: &Interval,
        name: &str,
        items: I,
    ) -> Result<usize, TaskError>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let mut w = self.writer(pipeline_id, interval, name)?;
        for item in items {
            w.push(&item)?;
        }
        w.commit()
    }

    /// Lee un artefacto completo. Si no existe es porque la tarea que lo
    /// produce no terminó.
    pub fn read_jsonl<T: DeserializeOwned>(
        &self,
        pipeline_id: &str,
        interval: &Interval,
        name: &str,
    ) -> Result<Vec<T>, TaskError> {
        let path = self.path(pipeline_id, interval, name);
        let file = File::open(&path).map_err(|e| {
            TaskError::Artifact(format!("cannot open {}: {e}", path.display()))
        })?;
        let reader = BufReader::new(file);

        let mut out = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line
                .map_err(|e| TaskError::Artifact(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let item: T = serde_json::from_str(&line).map_err(|e| {
                TaskError::Artifact(format!("{} line {}: {e}", path.display(), n + 1))
            })?;
            out.push(item);
        }
        Ok(out)
    }
}

/// Escribe JSONL en un temporal hermano y lo renombra al final. Si se suelta
/// sin `commit`, el temporal se borra y el artefacto anterior queda intacto.
pub struct JsonlWriter {
    tmp: PathBuf,
    target: PathBuf,
    out: Option<BufWriter<File>>,
    count: usize,
}

impl JsonlWriter {
    fn create(target: PathBuf) -> Result<Self, TaskError> {
        let io_err = |p: &Path, e: std::io::Error| {
            TaskError::Artifact(format!("cannot write {}: {e}", p.display()))
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));
        let file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;

        Ok(Self {
            tmp,
            target,
            out: Some(BufWriter::new(file)),
            count: 0,
        })
    }

    pub fn push<T: Serialize>(&mut self, item: &T) -> Result<(), TaskError> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| TaskError::Artifact("writer already closed".into()))?;
        serde_json::to_writer(&mut *out, item)
            .map_err(|e| TaskError::Artifact(format!("{}: {e}", self.tmp.display())))?;
        out.write_all(b"\n")
            .map_err(|e| TaskError::Artifact(format!("{}: {e}", self.tmp.display())))?;
        self.count += 1;
        Ok(())
    }

    pub fn commit(mut self) -> Result<usize, TaskError> {
        let err = |p: &Path, e: std::io::Error| TaskError::Artifact(format!("{}: {e}", p.display()));

        if let Some(mut out) = self.out.take() {
            out.flush().map_err(|e| err(&self.tmp, e))?;
            out.get_ref().sync_all().map_err(|e| err(&self.tmp, e))?;
        }
        fs::rename(&self.tmp, &self.target).map_err(|e| err(&self.target, e))?;
        debug!("artefacto {} ({} líneas)", self.target.display(), self.count);
        Ok(self.count)
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        // sólo queda `out` si no hubo commit
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// El trabajo de las tareas es síncrono (archivos, CSV); va a un hilo de
/// bloqueo para no frenar el runtime.
async fn run_blocking<F>(f: F) -> Result<TaskOutput, TaskError>
where
    F: FnOnce() -> Result<TaskOutput, TaskError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TaskError::Other(format!("blocking task failed: {e}")))?
}

fn check_cancel(ctx: &TaskContext) -> Result<(), TaskError> {
    if ctx.cancel.is_cancelled() {
        Err(TaskError::Cancelled)
    } else {
        Ok(())
    }
}

/* =========================
   extract
   ========================= */

/// Vuelca el origen del intervalo a `raw.jsonl`.
#[derive(Clone)]
pub struct ExtractTask {
    source: Arc<dyn RecordSource>,
    artifacts: ArtifactStore,
}

impl ExtractTask {
    pub fn new(source: Arc<dyn RecordSource>, artifacts: ArtifactStore) -> Self {
        Self { source, artifacts }
    }

    fn run(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let rows = self.source.read(&ctx.interval)?;
        let mut w = self
            .artifacts
            .writer(&ctx.pipeline_id, &ctx.interval, RAW_ARTIFACT)?;

        for (i, row) in rows.enumerate() {
            if i % CANCEL_CHECK_EVERY == 0 {
                check_cancel(ctx)?;
            }
            w.push(&row?)?;
        }
        let n = w.commit()?;

        info!(
            "[{}/{}] extract: {} fila(s) leídas de {}",
            ctx.pipeline_id,
            ctx.interval,
            n,
            self.source.name()
        );
        Ok(TaskOutput::default().metric("rows_read", n as u64))
    }
}

#[async_trait]
impl TaskCallable for ExtractTask {
    async fn call(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let this = self.clone();
        let ctx = ctx.clone();
        run_blocking(move || this.run(&ctx)).await
    }
}

/* =========================
   transform
   ========================= */

/// Limpia `raw.jsonl`, escala si el rechazo supera el umbral, aplica las
/// derivaciones y deja `transformed.jsonl`. Los rechazos quedan siempre en
/// `rejects.jsonl`.
#[derive(Clone)]
pub struct TransformTask {
    cleaner: Cleaner,
    transformer: Transformer,
    max_rejection_rate: f64,
    artifacts: ArtifactStore,
}

impl TransformTask {
    pub fn new(
        cleaner: Cleaner,
        transformer: Transformer,
        max_rejection_rate: f64,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            cleaner,
            transformer,
            max_rejection_rate,
            artifacts,
        }
    }

    fn run(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let raw: Vec<RawRecord> =
            self.artifacts
                .read_jsonl(&ctx.pipeline_id, &ctx.interval, RAW_ARTIFACT)?;
        check_cancel(ctx)?;

        let (batch, report) = self.cleaner.clean(raw, ctx.interval);
        self.artifacts.write_jsonl(
            &ctx.pipeline_id,
            &ctx.interval,
            REJECTS_ARTIFACT,
            report.rejected.iter(),
        )?;

        let by_reason = report.counts_by_reason();
        let count = |r: RejectReason| by_reason.get(&r).copied().unwrap_or(0) as u64;
        let rate = report.rejection_rate();

        if report.rejected_count() > 0 {
            warn!(
                "[{}/{}] transform: {} de {} fila(s) rechazadas (missing_field={}, type_mismatch={})",
                ctx.pipeline_id,
                ctx.interval,
                report.rejected_count(),
                report.total,
                count(RejectReason::MissingField),
                count(RejectReason::TypeMismatch)
            );
        }

        if rate > self.max_rejection_rate {
            return Err(TaskError::ValidationRejection {
                rejected: report.rejected_count(),
                total: report.total,
                rate,
                threshold: self.max_rejection_rate,
            });
        }

        check_cancel(ctx)?;
        let out = self.transformer.transform(batch)?;
        let rows_out = self.artifacts.write_jsonl(
            &ctx.pipeline_id,
            &ctx.interval,
            TRANSFORMED_ARTIFACT,
            out.records.iter(),
        )?;

        info!(
            "[{}/{}] transform: {} válidas, {} duplicadas, {} de salida",
            ctx.pipeline_id, ctx.interval, report.valid, report.duplicates_dropped, rows_out
        );

        Ok(TaskOutput::default()
            .metric("rows_read", report.total as u64)
            .metric("rows_valid", report.valid as u64)
            .metric("rows_rejected", report.rejected_count() as u64)
            .metric("rejected_missing_field", count(RejectReason::MissingField))
            .metric("rejected_type_mismatch", count(RejectReason::TypeMismatch))
            .metric("duplicates_dropped", report.duplicates_dropped as u64)
            .metric("rows_out", rows_out as u64))
    }
}

#[async_trait]
impl TaskCallable for TransformTask {
    async fn call(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let this = self.clone();
        let ctx = ctx.clone();
        run_blocking(move || this.run(&ctx)).await
    }
}

/* =========================
   load
   ========================= */

/// Publica `transformed.jsonl` en el almacenamiento particionado.
#[derive(Clone)]
pub struct LoadTask {
    sink: SinkWriter,
    schema: Schema,
    mode: WriteMode,
    artifacts: ArtifactStore,
}

impl LoadTask {
    pub fn new(sink: SinkWriter, schema: Schema, mode: WriteMode, artifacts: ArtifactStore) -> Self {
        Self {
            sink,
            schema,
            mode,
            artifacts,
        }
    }

    fn run(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let records: Vec<Record> =
            self.artifacts
                .read_jsonl(&ctx.pipeline_id, &ctx.interval, TRANSFORMED_ARTIFACT)?;
        let batch = Batch {
            interval: ctx.interval,
            schema: self.schema.clone(),
            records,
        };

        check_cancel(ctx)?;
        let summary = self
            .sink
            .write(&batch, &ctx.interval, self.mode, &ctx.cancel)
            .map_err(|e| match e {
                WriteError::Cancelled => TaskError::Cancelled,
                e => TaskError::Write(e),
            })?;

        Ok(TaskOutput::default()
            .metric("rows_written", summary.rows as u64)
            .metric("partitions_written", summary.files.len() as u64))
    }
}

#[async_trait]
impl TaskCallable for LoadTask {
    async fn call(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let this = self.clone();
        let ctx = ctx.clone();
        run_blocking(move || this.run(&ctx)).await
    }
}

/* =========================
   Grafo ETL
   ========================= */

/// Piezas del pipeline lineal extract → transform → load.
pub struct EtlStages {
    pub source: Arc<dyn RecordSource>,
    pub cleaner: Cleaner,
    pub transformer: Transformer,
    pub max_rejection_rate: f64,
    pub sink: SinkWriter,
    pub write_mode: WriteMode,
    pub artifacts: ArtifactStore,
}

impl EtlStages {
    /// Builder con las tres tareas estándar ya registradas. Quien llama puede
    /// añadir tareas extra (con sus dependencias) antes de `build`.
    pub fn graph_builder(self, retry: RetryPolicy) -> GraphBuilder {
        let output_schema = self.transformer.output_schema().clone();

        let extract = ExtractTask::new(self.source, self.artifacts.clone());
        let transform = TransformTask::new(
            self.cleaner,
            self.transformer,
            self.max_rejection_rate,
            self.artifacts.clone(),
        );
        let load = LoadTask::new(self.sink, output_schema, self.write_mode, self.artifacts);

        GraphBuilder::new()
            .with_default_retry(retry)
            .task(EXTRACT, &[], Arc::new(extract))
            .task(TRANSFORM, &[EXTRACT], Arc::new(transform))
            .task(LOAD, &[TRANSFORM], Arc::new(load))
    }
}
