use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WriteError;
use crate::record::{Batch, Interval, Record, Schema, Value};
use crate::storage::Storage;

pub const STAGING_PREFIX: &str = "_staging";
const NULL_PARTITION: &str = "__null__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Reemplaza todas las particiones del intervalo
    #[default]
    Overwrite,
    /// Falla si el intervalo ya tiene archivos finales
    ErrorIfExists,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub files: Vec<String>,
    pub removed: Vec<String>,
    pub rows: usize,
}

/// Escritor de particiones idempotente.
///
/// Cada intento escribe en `_staging/<intervalo>-<uuid>/` y sólo al terminar
/// mueve cada archivo a su ruta final con un rename atómico. Las rutas con
/// algún componente que empieza por `_` nunca son visibles para lectores.
#[derive(Clone)]
pub struct SinkWriter {
    storage: Arc<dyn Storage>,
    partition_by: Vec<String>,
}

impl SinkWriter {
    pub fn new(storage: Arc<dyn Storage>, partition_by: Vec<String>) -> Self {
        Self {
            storage,
            partition_by,
        }
    }

    pub fn partition_by(&self) -> &[String] {
        &self.partition_by
    }

    fn file_name(interval: &Interval) -> String {
        format!("part-{interval}.csv")
    }

    /// Archivos finales (visibles) del intervalo, ordenados.
    pub fn finals_for(&self, interval: &Interval) -> Result<Vec<String>, WriteError> {
        let name = Self::file_name(interval);
        Ok(self
            .storage
            .list("")?
            .into_iter()
            .filter(|k| is_visible(k) && k.rsplit('/').next() == Some(name.as_str()))
            .collect())
    }

    /// Escribe el batch como las particiones del intervalo.
    ///
    /// Escribir dos veces el mismo contenido deja el almacenamiento igual que
    /// escribirlo una vez: los archivos se reemplazan, nunca se anexan, y las
    /// particiones que el batch ya no produce se borran.
    pub fn write(
        &self,
        batch: &Batch,
        interval: &Interval,
        mode: WriteMode,
        cancel: &CancellationToken,
    ) -> Result<WriteSummary, WriteError> {
        let groups = self.group_by_partition(batch)?;
        let existing = self.finals_for(interval)?;

        if mode == WriteMode::ErrorIfExists && !existing.is_empty() {
            return Err(WriteError::AlreadyExists(format!(
                "interval {interval} already has {} file(s)",
                existing.len()
            )));
        }

        self.sweep_staging(interval)?;

        let staging = format!("{STAGING_PREFIX}/{interval}-{}", uuid::Uuid::new_v4());
        let file_name = Self::file_name(interval);

        // 1) todo a staging; si algo falla, limpiamos y los finales quedan intactos
        let mut staged: Vec<(String, String)> = Vec::with_capacity(groups.len());
        for (dir, rows) in &groups {
            let final_key = if dir.is_empty() {
                file_name.clone()
            } else {
                format!("{dir}/{file_name}")
            };
            let staging_key = format!("{staging}/{final_key}");

            if cancel.is_cancelled() {
                return Err(self.abandon(&staging));
            }
            let bytes = encode_csv(&batch.schema, rows)?;
            if let Err(e) = self.storage.put(&staging_key, &bytes) {
                warn!("fallo escribiendo staging {}: {}", staging_key, e);
                let _ = self.storage.delete_prefix(&staging);
                return Err(e);
            }
            staged.push((staging_key, final_key));
        }

        // última oportunidad de cancelar: a partir de aquí se publica todo
        if cancel.is_cancelled() {
            return Err(self.abandon(&staging));
        }

        // 2) swap atómico por partición
        for (staging_key, final_key) in &staged {
            self.storage.atomic_rename(staging_key, final_key)?;
            debug!("partición publicada: {}", final_key);
        }

        // 3) borrar particiones viejas que este batch ya no produce
        let written: BTreeSet<&str> = staged.iter().map(|(_, f)| f.as_str()).collect();
        let mut removed = Vec::new();
        for old in existing {
            if !written.contains(old.as_str()) {
                self.storage.delete(&old)?;
                removed.push(old);
            }
        }

        self.storage.delete_prefix(&staging)?;

        let summary = WriteSummary {
            files: staged.into_iter().map(|(_, f)| f).collect(),
            removed,
            rows: batch.len(),
        };

        info!(
            "intervalo {} escrito: {} fila(s) en {} archivo(s), {} obsoleto(s) borrado(s)",
            interval,
            summary.rows,
            summary.files.len(),
            summary.removed.len()
        );
        Ok(summary)
    }

    fn abandon(&self, staging: &str) -> WriteError {
        warn!("escritura cancelada, se descarta {}", staging);
        if let Err(e) = self.storage.delete_prefix(staging) {
            warn!("no se pudo borrar {}: {}", staging, e);
        }
        WriteError::Cancelled
    }

    /// Borra staging abandonado de intentos anteriores del mismo intervalo.
    pub fn sweep_staging(&self, interval: &Interval) -> Result<usize, WriteError> {
        let marker = format!("{interval}-");
        let mut dirs: BTreeSet<String> = BTreeSet::new();

        for key in self.storage.list(STAGING_PREFIX)? {
            if let Some(dir) = key.split('/').nth(1) {
                if dir.starts_with(&marker) {
                    dirs.insert(dir.to_string());
                }
            }
        }

        for dir in &dirs {
            warn!("borrando staging abandonado {}/{}", STAGING_PREFIX, dir);
            self.storage.delete_prefix(&format!("{STAGING_PREFIX}/{dir}"))?;
        }
        Ok(dirs.len())
    }

    /// Lee todas las particiones visibles del intervalo de vuelta a un batch.
    pub fn read_interval(&self, interval: &Interval, schema: &Schema) -> Result<Batch, WriteError> {
        let mut batch = Batch::new(*interval, schema.clone());

        for key in self.finals_for(interval)? {
            let bytes = self.storage.get(&key)?;
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_reader(bytes.as_slice());

            let headers: Vec<String> = reader
                .headers()
                .map_err(|e| WriteError::Encode(format!("{key}: {e}")))?
                .iter()
                .map(|s| s.to_string())
                .collect();

            let positions: Vec<Option<usize>> =
                schema.columns.iter().map(|c| headers.iter().position(|h| *h == c.name)).collect();

            for row in reader.records() {
                let row = row.map_err(|e| WriteError::Encode(format!("{key}: {e}")))?;
                let mut values = Vec::with_capacity(schema.len());
                for (col, pos) in schema.columns.iter().zip(&positions) {
                    let cell = pos.and_then(|p| row.get(p)).unwrap_or("");
                    if cell.is_empty() {
                        values.push(Value::Null);
                        continue;
                    }
                    let v = Value::parse_text(cell, col.ty).ok_or_else(|| {
                        WriteError::Encode(format!(
                            "{key}: value '{cell}' of column '{}' is not a {}",
                            col.name, col.ty
                        ))
                    })?;
                    values.push(v);
                }
                batch.records.push(Record(values));
            }
        }

        Ok(batch)
    }

    fn group_by_partition<'a>(
        &self,
        batch: &'a Batch,
    ) -> Result<BTreeMap<String, Vec<&'a Record>>, WriteError> {
        let mut idx = Vec::with_capacity(self.partition_by.len());
        for col in &self.partition_by {
            let i = batch.schema.index_of(col).ok_or_else(|| {
                WriteError::Encode(format!("partition column '{col}' not in batch schema"))
            })?;
            idx.push((col.as_str(), i));
        }

        let mut groups: BTreeMap<String, Vec<&Record>> = BTreeMap::new();
        for rec in &batch.records {
            let dir: Vec<String> = idx
                .iter()
                .map(|(name, i)| format!("{name}={}", partition_value(&rec.0[*i])))
                .collect();
            groups.entry(dir.join("/")).or_default().push(rec);
        }
        Ok(groups)
    }
}

/// Un archivo es visible si ningún componente de su ruta empieza por `_` o `.`.
pub fn is_visible(key: &str) -> bool {
    key.split('/')
        .all(|part| !part.starts_with('_') && !part.starts_with('.'))
}

fn partition_value(v: &Value) -> String {
    match v {
        Value::Null => NULL_PARTITION.to_string(),
        other => other
            .to_string()
            .replace('%', "%25")
            .replace('/', "%2F"),
    }
}

fn encode_csv(schema: &Schema, rows: &[&Record]) -> Result<Vec<u8>, WriteError> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(schema.names())
        .map_err(|e| WriteError::Encode(e.to_string()))?;
    for r in rows {
        w.write_record(r.0.iter().map(|v| v.to_string()))
            .map_err(|e| WriteError::Encode(e.to_string()))?;
    }
    w.into_inner()
        .map_err(|e| WriteError::Encode(e.to_string()))
}
