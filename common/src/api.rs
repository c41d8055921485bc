use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::record::Interval;
use crate::state::{RunRecord, RunStatus, TaskRecord};

/// Código de salida cuando el cliente deja de esperar un run que sigue vivo.
pub const EXIT_STILL_RUNNING: i32 = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub interval: Interval,
    #[serde(default)]
    pub force: bool,
}

/// Estado estructurado de un run, pensado para polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatusResponse {
    pub run: RunRecord,
    pub tasks: Vec<TaskRecord>,
}

impl RunStatusResponse {
    pub fn exit_code(&self) -> i32 {
        run_exit_code(&self.run)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default)]
    pub kind: Option<FailureKind>,
}

/// 0 si el run terminó bien; si no, el código del tipo de fallo.
pub fn run_exit_code(run: &RunRecord) -> i32 {
    match run.status {
        RunStatus::Success => 0,
        RunStatus::Running => EXIT_STILL_RUNNING,
        RunStatus::Failed | RunStatus::Cancelled => run
            .failure_kind
            .unwrap_or(FailureKind::Other)
            .exit_code(),
    }
}
