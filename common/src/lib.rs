pub mod api;
pub mod cleaner;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod record;
pub mod results;
pub mod runner;
pub mod sink;
pub mod source;
pub mod state;
pub mod storage;
pub mod task;
pub mod transform;

pub use api::{run_exit_code, ErrorResponse, RunStatusResponse, TriggerRequest, EXIT_STILL_RUNNING};
pub use config::PipelineConfig;
pub use dag::{GraphBuilder, TaskGraph};
pub use error::{
    ConfigError, FailureKind, GraphError, RunnerError, SchemaError, SourceError, StoreError,
    TaskError, TransformError, WriteError,
};
pub use record::{Batch, Column, ColumnType, Interval, Record, Schema, Value};
pub use results::RunResults;
pub use runner::{Runner, RunnerConfig};
pub use state::{HistoryEntry, JournalStore, RunRecord, RunStatus, StateStore, TaskRecord, Trigger};
pub use task::{RetryPolicy, TaskCallable, TaskContext, TaskOutput, TaskState};
