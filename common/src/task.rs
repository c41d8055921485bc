use std::{collections::BTreeMap, fmt, future::Future, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::record::Interval;

pub type TaskId = String;

/// Estado de una tarea dentro de un run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
    UpstreamFailed,
    Skipped,
}

impl TaskState {
    /// Transiciones que puede hacer el runner durante la ejecución normal.
    /// Los reinicios manuales (`retry_task`, run forzado, recuperación tras
    /// caída) pasan por `reset` y no por aquí.
    pub fn can_transition(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, UpstreamFailed)
                | (Pending, Skipped)
                | (Running, Success)
                | (Running, Failed)
                | (Failed, Retrying)
                | (Retrying, Running)
                | (Retrying, Skipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Política de reintentos: cantidad máxima de intentos y backoff exponencial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Espera antes del intento `attempt + 1`, sabiendo que falló `attempt` (base 1).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = ms.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Lo que recibe el callable en cada intento.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub pipeline_id: String,
    pub interval: Interval,
    pub task_id: TaskId,
    /// Número de intento actual (base 1)
    pub attempt: u32,
    pub cancel: CancellationToken,
}

/// Métricas que devuelve una tarea; quedan guardadas en su registro de estado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub metrics: BTreeMap<String, u64>,
}

impl TaskOutput {
    pub fn metric(mut self, name: &str, value: u64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// Contrato opaco de una tarea. Debe ser seguro invocarlo varias veces para
/// el mismo intervalo.
#[async_trait]
pub trait TaskCallable: Send + Sync {
    async fn call(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;
}

/// Adaptador para usar un closure async como tarea.
pub struct FnTask<F>(pub F);

#[async_trait]
impl<F, Fut> TaskCallable for FnTask<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
{
    async fn call(&self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        (self.0)(ctx.clone()).await
    }
}
