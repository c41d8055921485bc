use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clasificación serializable de fallos. Se guarda en los registros de
/// tareas/runs y se traduce a códigos de salida en el cliente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    GraphError,
    ValidationRejection,
    WriteError,
    UpstreamFailed,
    Cancelled,
    Other,
}

impl FailureKind {
    /// Código de salida del proceso para este tipo de fallo.
    pub fn exit_code(self) -> i32 {
        match self {
            FailureKind::Other => 1,
            FailureKind::GraphError => 2,
            FailureKind::SourceUnavailable => 3,
            FailureKind::ValidationRejection => 4,
            FailureKind::WriteError => 5,
            FailureKind::UpstreamFailed => 6,
            FailureKind::Cancelled => 7,
        }
    }
}

/// DAG inválido. Fatal al registrar el grafo, nunca se reintenta.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("graph has no tasks")]
    Empty,

    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("dangling dependency: task '{task_id}' depends on unknown '{missing}'")]
    DanglingDependency { task_id: String, missing: String },

    #[error("cycle detected: {0}")]
    Cycle(String),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("malformed input in {path}: {detail}")]
    Malformed { path: String, detail: String },
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("storage io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("target already finalized: {0}")]
    AlreadyExists(String),

    #[error("encoding error: {0}")]
    Encode(String),

    #[error("write cancelled before publishing")]
    Cancelled,
}

/// Esquema inconsistente después de normalizar nombres.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("column '{0}' normalizes to an empty name")]
    EmptyName(String),

    #[error("duplicate column '{0}' after normalization")]
    DuplicateColumn(String),

    #[error("dedup key column '{0}' not in schema")]
    UnknownKeyColumn(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("column '{0}' already exists")]
    DuplicateColumn(String),

    #[error("cannot cast value '{value}' of column '{column}' to {target}")]
    Cast {
        column: String,
        value: String,
        target: String,
    },

    #[error("invalid expression: {0}")]
    InvalidExpr(String),
}

/// Error devuelto por el callable de una tarea. El runner lo convierte en
/// transición de estado; nunca sale como pánico del proceso.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("rejection rate {rate:.3} exceeds threshold {threshold:.3} ({rejected}/{total} rows)")]
    ValidationRejection {
        rejected: usize,
        total: usize,
        rate: f64,
        threshold: f64,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("upstream task '{0}' failed")]
    UpstreamFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("{0}")]
    Other(String),
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Source(_) => FailureKind::SourceUnavailable,
            TaskError::ValidationRejection { .. } => FailureKind::ValidationRejection,
            TaskError::Write(_) => FailureKind::WriteError,
            TaskError::UpstreamFailed(_) => FailureKind::UpstreamFailed,
            TaskError::Cancelled => FailureKind::Cancelled,
            TaskError::Transform(_) | TaskError::Artifact(_) | TaskError::Other(_) => {
                FailureKind::Other
            }
        }
    }

    /// Cancelaciones, dependencias caídas y rechazos por calidad de datos no
    /// se reintentan: otro intento sobre la misma entrada da lo mismo.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TaskError::Cancelled
                | TaskError::UpstreamFailed(_)
                | TaskError::ValidationRejection { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        key: String,
        expected: String,
        found: String,
    },

    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("state store lock poisoned")]
    Poisoned,

    #[error("invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
    },
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("a run for interval {0} is already in progress")]
    RunInProgress(String),

    #[error("no run recorded for interval {0}")]
    UnknownRun(String),

    #[error("no run in progress for interval {0}")]
    NotRunning(String),

    #[error("task '{task}' cannot be retried from state {state}")]
    NotRetryable { task: String, state: String },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Write(#[from] WriteError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_son_distintos_por_tipo() {
        let kinds = [
            FailureKind::Other,
            FailureKind::GraphError,
            FailureKind::SourceUnavailable,
            FailureKind::ValidationRejection,
            FailureKind::WriteError,
            FailureKind::UpstreamFailed,
            FailureKind::Cancelled,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c != 0));
    }

    #[test]
    fn cancelled_y_upstream_no_se_reintentan() {
        assert!(!TaskError::Cancelled.is_retryable());
        assert!(!TaskError::UpstreamFailed("extract".into()).is_retryable());
        assert!(TaskError::Source(SourceError::Unavailable("x".into())).is_retryable());
        assert!(!TaskError::ValidationRejection {
            rejected: 1,
            total: 2,
            rate: 0.5,
            threshold: 0.1
        }
        .is_retryable());
        assert_eq!(
            TaskError::Write(WriteError::Encode("x".into())).kind(),
            FailureKind::WriteError
        );
    }
}
