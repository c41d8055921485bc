use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SchemaError;
use crate::record::{normalize_column_name, Batch, Interval, RawRecord, Record, Schema, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingField,
    TypeMismatch,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingField => "missing_field",
            RejectReason::TypeMismatch => "type_mismatch",
        }
    }
}

/// Fila rechazada con su motivo. Se conserva el registro original
/// para poder auditarlo después.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Posición de la fila en la entrada (base 0)
    pub row: usize,
    pub reason: RejectReason,
    pub column: String,
    pub record: RawRecord,
}

/// Contabilidad de una pasada de limpieza. Nada se descarta sin quedar
/// reflejado aquí.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanReport {
    pub total: usize,
    pub valid: usize,
    pub duplicates_dropped: usize,
    pub rejected: Vec<Rejection>,
}

impl CleanReport {
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }

    pub fn counts_by_reason(&self) -> BTreeMap<RejectReason, usize> {
        let mut out = BTreeMap::new();
        for r in &self.rejected {
            *out.entry(r.reason).or_insert(0) += 1;
        }
        out
    }

    /// Fracción de filas rechazadas sobre el total leído. 0 si no hubo filas.
    pub fn rejection_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.rejected.len() as f64 / self.total as f64
        }
    }
}

/// Validador/limpiador de esquema.
#[derive(Debug, Clone)]
pub struct Cleaner {
    schema: Schema,
    /// Columnas (normalizadas) que identifican un duplicado
    key: Vec<String>,
}

impl Cleaner {
    /// El esquema se normaliza aquí; falla si hay colisiones de nombres o si
    /// la clave de deduplicación menciona columnas que no existen.
    pub fn new(schema: &Schema, key: &[String]) -> Result<Self, SchemaError> {
        let schema = schema.normalized()?;
        let key: Vec<String> = key.iter().map(|k| normalize_column_name(k)).collect();
        for k in &key {
            if schema.index_of(k).is_none() {
                return Err(SchemaError::UnknownKeyColumn(k.clone()));
            }
        }
        Ok(Self { schema, key })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Aplica el esquema a los registros crudos.
    ///
    /// - columna requerida ausente o vacía → `missing_field`
    /// - valor no convertible → `type_mismatch`
    /// - duplicados por clave → se queda la última aparición
    ///
    /// Las columnas se revisan en orden de esquema y el primer problema
    /// decide el motivo del rechazo.
    pub fn clean<I>(&self, raw: I, interval: Interval) -> (Batch, CleanReport)
    where
        I: IntoIterator<Item = RawRecord>,
    {
        let mut report = CleanReport::default();
        let mut accepted: Vec<Record> = Vec::new();

        for (row, rec) in raw.into_iter().enumerate() {
            report.total += 1;

            // normalizamos nombres; dos columnas crudas que colapsan al mismo
            // nombre dejan una sola entrada
            let coerced = {
                let mut by_name: HashMap<String, &serde_json::Value> = HashMap::new();
                for (k, v) in rec.iter() {
                    by_name.insert(normalize_column_name(k), v);
                }
                self.coerce_row(&by_name)
            };

            match coerced {
                Ok(values) => accepted.push(Record(values)),
                Err((reason, column)) => report.rejected.push(Rejection {
                    row,
                    reason,
                    column,
                    record: rec,
                }),
            }
        }

        let records = self.dedup_keep_last(accepted, &mut report);
        report.valid = records.len();

        debug!(
            "clean {}: total={} valid={} rejected={} duplicates={}",
            interval,
            report.total,
            report.valid,
            report.rejected.len(),
            report.duplicates_dropped
        );

        let batch = Batch {
            interval,
            schema: self.schema.clone(),
            records,
        };
        (batch, report)
    }

    fn coerce_row(
        &self,
        by_name: &HashMap<String, &serde_json::Value>,
    ) -> Result<Vec<Value>, (RejectReason, String)> {
        let mut values = Vec::with_capacity(self.schema.len());

        for col in &self.schema.columns {
            let coerced = match by_name.get(&col.name) {
                None => None,
                Some(raw) => Value::coerce_json(raw, col.ty)
                    .map_err(|_| (RejectReason::TypeMismatch, col.name.clone()))?,
            };

            match coerced {
                Some(v) => values.push(v),
                None if col.nullable => values.push(Value::Null),
                None => return Err((RejectReason::MissingField, col.name.clone())),
            }
        }

        Ok(values)
    }

    fn dedup_keep_last(&self, records: Vec<Record>, report: &mut CleanReport) -> Vec<Record> {
        if self.key.is_empty() {
            return records;
        }

        let key_idx: Vec<usize> = self
            .key
            .iter()
            .filter_map(|k| self.schema.index_of(k))
            .collect();

        let key_of = |r: &Record| -> String {
            // serde_json da una representación estable y sin ambigüedad
            let parts: Vec<&Value> = key_idx.iter().map(|i| &r.0[*i]).collect();
            serde_json::to_string(&parts).unwrap_or_default()
        };

        let mut last_pos: HashMap<String, usize> = HashMap::new();
        for (pos, r) in records.iter().enumerate() {
            last_pos.insert(key_of(r), pos);
        }

        let before = records.len();
        let out: Vec<Record> = records
            .into_iter()
            .enumerate()
            .filter(|(pos, r)| last_pos.get(&key_of(r)) == Some(pos))
            .map(|(_, r)| r)
            .collect();

        report.duplicates_dropped = before - out.len();
        out
    }
}
