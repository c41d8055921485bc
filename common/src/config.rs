use std::{env, fs, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cleaner::Cleaner;
use crate::engine::{ArtifactStore, EtlStages};
use crate::error::ConfigError;
use crate::record::{Column, Interval, Schema};
use crate::runner::{Runner, RunnerConfig};
use crate::sink::{SinkWriter, WriteMode};
use crate::source::{CsvSource, JsonlSource, RecordSource};
use crate::state::{JournalStore, StateStore};
use crate::storage::LocalStorage;
use crate::task::RetryPolicy;
use crate::transform::{Step, Transformer};

pub const DEFAULT_CONFIG_PATH: &str = "pipeline.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Csv,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Plantilla de ruta; `{interval}` se reemplaza por `YYYY-MM-DD`.
    /// Puede ser un glob.
    pub path: String,
    #[serde(default)]
    pub delimiter: Option<char>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub columns: Vec<Column>,
    /// Columnas que identifican un duplicado
    #[serde(default)]
    pub key: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Fracción de filas rechazadas a partir de la cual falla la tarea
    pub max_rejection_rate: f64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            max_rejection_rate: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub partition_by: Vec<String>,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    /// Primer intervalo que el scheduler considera
    pub start: Option<Interval>,
    pub tick_secs: u64,
    /// true: procesa todos los intervalos atrasados, del más viejo al más nuevo
    pub catchup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start: None,
            tick_secs: 60,
            catchup: true,
        }
    }
}

/// Descripción completa de un pipeline, tal como viene del TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Journal de estado; sin él el estado vive sólo en memoria
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub source: SourceConfig,
    pub schema: SchemaConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub transform: Vec<Step>,
    pub sink: SinkConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

impl PipelineConfig {
    /// Parsea y valida, sin mirar variables de entorno.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: PipelineConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Lee el archivo, aplica overrides de entorno y valida.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let mut cfg: PipelineConfig = toml::from_str(&text)?;
        cfg.apply_overrides(|k| env::var(k).ok())?;
        cfg.validate()?;
        info!("configuración {} cargada (pipeline={})", path, cfg.pipeline_id);
        Ok(cfg)
    }

    /// Ruta de `ETL_CONFIG`, o `pipeline.toml` si no está definida.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = env::var("ETL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(&path)
    }

    /// `ETL_MAX_PARALLEL`, `ETL_WORK_DIR` y `ETL_STATE_PATH` pisan al archivo.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ETL_MAX_PARALLEL") {
            self.runner.max_parallel = v.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("ETL_MAX_PARALLEL is not a number: '{v}'"))
            })?;
        }
        if let Some(v) = lookup("ETL_WORK_DIR") {
            self.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ETL_STATE_PATH") {
            self.state_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: String| Err(ConfigError::Invalid(m));

        if self.pipeline_id.trim().is_empty() {
            return invalid("pipeline_id is empty".into());
        }
        if self.runner.max_parallel == 0 {
            return invalid("runner.max_parallel must be >= 1".into());
        }
        if self.runner.max_failed_tasks == 0 {
            return invalid("runner.max_failed_tasks must be >= 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be >= 1".into());
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return invalid("retry.multiplier must be >= 1".into());
        }
        let rate = self.cleaning.max_rejection_rate;
        if !(0.0..=1.0).contains(&rate) {
            return invalid(format!("cleaning.max_rejection_rate {rate} not in [0, 1]"));
        }
        if self.schema.columns.is_empty() {
            return invalid("schema has no columns".into());
        }
        if let Some(d) = self.source.delimiter {
            if !d.is_ascii() {
                return invalid(format!("source.delimiter '{d}' is not ascii"));
            }
        }

        // compila cleaner + transformer para detectar errores antes del primer run
        let output = self.output_schema()?;
        for col in &self.sink.partition_by {
            if output.index_of(col).is_none() {
                return invalid(format!("partition column '{col}' not in output schema"));
            }
        }
        Ok(())
    }

    pub fn cleaner(&self) -> Result<Cleaner, ConfigError> {
        Ok(Cleaner::new(
            &Schema::new(self.schema.columns.clone()),
            &self.schema.key,
        )?)
    }

    pub fn transformer(&self, cleaner: &Cleaner) -> Result<Transformer, ConfigError> {
        Ok(Transformer::new(&self.transform, cleaner.schema())?)
    }

    /// Esquema de las particiones escritas.
    pub fn output_schema(&self) -> Result<Schema, ConfigError> {
        let cleaner = self.cleaner()?;
        Ok(self.transformer(&cleaner)?.output_schema().clone())
    }

    pub fn record_source(&self) -> Arc<dyn RecordSource> {
        match self.source.kind {
            SourceKind::Csv => {
                let mut src = CsvSource::new(&self.source.path);
                if let Some(d) = self.source.delimiter {
                    src = src.with_delimiter(d as u8);
                }
                Arc::new(src)
            }
            SourceKind::Jsonl => Arc::new(JsonlSource::new(&self.source.path)),
        }
    }

    pub fn sink_writer(&self) -> Result<SinkWriter, ConfigError> {
        let storage = Arc::new(LocalStorage::new(&self.sink.root)?);
        Ok(SinkWriter::new(storage, self.sink.partition_by.clone()))
    }

    pub fn state_store(&self) -> Result<Arc<dyn StateStore>, ConfigError> {
        Ok(match &self.state_path {
            Some(path) => Arc::new(JournalStore::open(path)?),
            None => Arc::new(JournalStore::in_memory()),
        })
    }

    pub fn stages(&self) -> Result<EtlStages, ConfigError> {
        let cleaner = self.cleaner()?;
        let transformer = self.transformer(&cleaner)?;
        Ok(EtlStages {
            source: self.record_source(),
            cleaner,
            transformer,
            max_rejection_rate: self.cleaning.max_rejection_rate,
            sink: self.sink_writer()?,
            write_mode: self.sink.mode,
            artifacts: ArtifactStore::new(&self.work_dir),
        })
    }

    /// Grafo extract → transform → load sobre el store configurado.
    pub fn build_runner(&self) -> Result<Runner, ConfigError> {
        let graph = self.stages()?.graph_builder(self.retry).build()?;
        Ok(Runner::new(
            &self.pipeline_id,
            graph,
            self.state_store()?,
            self.runner,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchemaError;
    use crate::record::{ColumnType, Value};
    use crate::state::{RunStatus, Trigger};
    use std::collections::HashMap;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("etl_config_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn sample(base: &std::path::Path) -> String {
        format!(
            r#"
pipeline_id = "orders"
work_dir = "{work}"
state_path = "{state}"

[runner]
max_parallel = 2

[retry]
max_attempts = 2
initial_backoff_ms = 0

[source]
kind = "csv"
path = "{input}/orders-{{interval}}.csv"

[schema]
key = ["Order ID"]

[[schema.columns]]
name = "Order ID"
type = "int"

[[schema.columns]]
name = "date"
type = "date"

[[schema.columns]]
name = "qty"
type = "int"

[[schema.columns]]
name = "price"
type = "float"
nullable = true

[cleaning]
max_rejection_rate = 0.6

[[transform]]
op = "derive"
column = "year"
expr = {{ year = {{ col = "date" }} }}

[[transform]]
op = "filter"
column = "qty"
cmp = "gt"
value = 0

[sink]
root = "{lake}"
partition_by = ["year"]
"#,
            work = base.join("work").display(),
            state = base.join("state.jsonl").display(),
            input = base.join("input").display(),
            lake = base.join("lake").display(),
        )
    }

    #[test]
    fn defaults_y_parseo() {
        let base = temp_dir("parse");
        let cfg = PipelineConfig::from_toml_str(&sample(&base)).unwrap();

        assert_eq!(cfg.runner.max_parallel, 2);
        assert_eq!(cfg.runner.max_failed_tasks, 1);
        assert_eq!(cfg.retry.max_attempts, 2);
        assert_eq!(cfg.retry.max_backoff_ms, 60_000);
        assert_eq!(cfg.sink.mode, WriteMode::Overwrite);
        assert!(cfg.schedule.catchup);
        assert_eq!(cfg.transform.len(), 2);

        let out = cfg.output_schema().unwrap();
        assert_eq!(out.names(), vec!["order_id", "date", "qty", "price", "year"]);
        assert_eq!(out.column("year").unwrap().ty, ColumnType::Int);
    }

    #[test]
    fn overrides_de_entorno() {
        let base = temp_dir("env");
        let mut cfg = PipelineConfig::from_toml_str(&sample(&base)).unwrap();
        let vars: HashMap<&str, &str> = [("ETL_MAX_PARALLEL", "8"), ("ETL_WORK_DIR", "/tmp/w")]
            .into_iter()
            .collect();

        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.runner.max_parallel, 8);
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/w"));

        let bad = cfg.apply_overrides(|k| (k == "ETL_MAX_PARALLEL").then(|| "muchos".to_string()));
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn configuraciones_invalidas() {
        let base = temp_dir("invalid");
        let good = sample(&base);

        let rate = good.replace("max_rejection_rate = 0.6", "max_rejection_rate = 1.5");
        assert!(matches!(
            PipelineConfig::from_toml_str(&rate),
            Err(ConfigError::Invalid(_))
        ));

        let attempts = good.replace("max_attempts = 2", "max_attempts = 0");
        assert!(PipelineConfig::from_toml_str(&attempts).is_err());

        let unknown = good.replace(r#"col = "date""#, r#"col = "fecha""#);
        assert!(matches!(
            PipelineConfig::from_toml_str(&unknown),
            Err(ConfigError::Transform(_))
        ));

        let partition = good.replace(r#"partition_by = ["year"]"#, r#"partition_by = ["month"]"#);
        assert!(PipelineConfig::from_toml_str(&partition).is_err());

        let key = good.replace(r#"key = ["Order ID"]"#, r#"key = ["sku"]"#);
        assert!(matches!(
            PipelineConfig::from_toml_str(&key),
            Err(ConfigError::Schema(SchemaError::UnknownKeyColumn(_)))
        ));

        assert!(matches!(
            PipelineConfig::from_toml_str("pipeline_id = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn runner_desde_config_procesa_csv() {
        let base = temp_dir("csv_run");
        fs::create_dir_all(base.join("input")).unwrap();
        fs::write(
            base.join("input").join("orders-2023-01-01.csv"),
            "Order ID,Date,Qty,Price\n1,2023-01-01,2,10\n2,2023-01-01,bad,\n3,2023-01-01,0,4.5\n1,2023-01-01,5,11\n",
        )
        .unwrap();

        let cfg = PipelineConfig::from_toml_str(&sample(&base)).unwrap();
        let runner = cfg.build_runner().unwrap();
        let day: Interval = "2023-01-01".parse().unwrap();

        let run = runner.run(day, Trigger::Manual, false).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);

        let out = cfg.output_schema().unwrap();
        let batch = cfg.sink_writer().unwrap().read_interval(&day, &out).unwrap();
        // fila 2 rechazada, fila 3 filtrada por qty, order 1 deduplicado (gana la última)
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.records[0].get(&out, "qty"), Some(&Value::Int(5)));

        // el journal sobrevive al runner
        drop(runner);
        let again = cfg.build_runner().unwrap();
        assert_eq!(
            again.status(&day).unwrap().unwrap().status,
            RunStatus::Success
        );
        assert!(again.interrupted_runs().unwrap().is_empty());
    }
}
