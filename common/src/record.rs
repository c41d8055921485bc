use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, str::FromStr};

use crate::error::SchemaError;

/// Registro crudo tal como sale de una fuente: sin esquema, columnas
/// posiblemente de más o de menos. Los valores son JSON para poder
/// representar tanto CSV (todo texto) como JSONL (tipado).
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/* =========================
   Intervalo lógico
   ========================= */

/// Intervalo lógico que procesa un run (un día).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(pub NaiveDate);

impl Interval {
    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn next(&self) -> Option<Interval> {
        self.0.succ_opt().map(Interval)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for Interval {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).map(Interval)
    }
}

/* =========================
   Tipos y valores
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Date,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Date => "date",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Str(String),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convierte un valor crudo (JSON) al tipo declarado.
    /// - `Ok(None)`: el valor falta (null o texto vacío)
    /// - `Err(())`: no se puede convertir
    #[allow(clippy::result_unit_err)]
    pub fn coerce_json(raw: &serde_json::Value, ty: ColumnType) -> Result<Option<Value>, ()> {
        use serde_json::Value as J;

        match raw {
            J::Null => Ok(None),
            J::String(s) if s.trim().is_empty() => Ok(None),
            J::String(s) => Value::parse_text(s, ty).map(Some).ok_or(()),
            J::Number(n) => match ty {
                ColumnType::Int => {
                    if let Some(i) = n.as_i64() {
                        Ok(Some(Value::Int(i)))
                    } else {
                        match n.as_f64() {
                            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                                Ok(Some(Value::Int(f as i64)))
                            }
                            _ => Err(()),
                        }
                    }
                }
                ColumnType::Float => n.as_f64().map(|f| Some(Value::Float(f))).ok_or(()),
                ColumnType::String => Ok(Some(Value::Str(n.to_string()))),
                ColumnType::Date => Err(()),
            },
            J::Bool(b) => match ty {
                ColumnType::String => Ok(Some(Value::Str(b.to_string()))),
                _ => Err(()),
            },
            J::Array(_) | J::Object(_) => Err(()),
        }
    }

    /// Parsea texto (celda CSV) al tipo pedido. `None` si no es convertible.
    pub fn parse_text(s: &str, ty: ColumnType) -> Option<Value> {
        let t = s.trim();
        match ty {
            ColumnType::String => Some(Value::Str(s.to_string())),
            ColumnType::Int => t.parse::<i64>().ok().map(Value::Int),
            ColumnType::Float => t.parse::<f64>().ok().map(Value::Float),
            ColumnType::Date => NaiveDate::parse_from_str(t, DATE_FORMAT)
                .ok()
                .map(Value::Date),
        }
    }

    /// Cast entre tipos ya validados. Null se mantiene null.
    pub fn cast(&self, ty: ColumnType) -> Option<Value> {
        match (self, ty) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Str(s), _) => Value::parse_text(s, ty),
            (Value::Int(i), ColumnType::Int) => Some(Value::Int(*i)),
            (Value::Int(i), ColumnType::Float) => Some(Value::Float(*i as f64)),
            (Value::Float(f), ColumnType::Float) => Some(Value::Float(*f)),
            (Value::Float(f), ColumnType::Int) if f.fract() == 0.0 => Some(Value::Int(*f as i64)),
            (Value::Date(d), ColumnType::Date) => Some(Value::Date(*d)),
            (v, ColumnType::String) => Some(Value::Str(v.to_string())),
            _ => None,
        }
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Str(_) => Some(ColumnType::String),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Date(_) => Some(ColumnType::Date),
        }
    }

    /// Comparación para filtros. Null no es comparable con nada.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// Representación en texto usada en los archivos de partición.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
        }
    }
}

/* =========================
   Esquema
   ========================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

impl Column {
    pub fn new(name: &str, ty: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable,
        }
    }
}

/// Secuencia ordenada de columnas. No se modifica una vez empezado un run:
/// el transformer produce un esquema nuevo en lugar de mutar éste.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Mismo esquema con nombres normalizados. Falla si dos columnas
    /// colisionan después de normalizar.
    pub fn normalized(&self) -> Result<Schema, SchemaError> {
        let mut out: Vec<Column> = Vec::with_capacity(self.columns.len());
        for c in &self.columns {
            let name = normalize_column_name(&c.name);
            if name.is_empty() {
                return Err(SchemaError::EmptyName(c.name.clone()));
            }
            if out.iter().any(|o| o.name == name) {
                return Err(SchemaError::DuplicateColumn(name));
            }
            out.push(Column {
                name,
                ty: c.ty,
                nullable: c.nullable,
            });
        }
        Ok(Schema { columns: out })
    }
}

/// Forma canónica de un nombre de columna: minúsculas, sin espacios en los
/// extremos, y cualquier tramo de espacios / `-` / `.` / `/` pasa a un solo `_`.
pub fn normalize_column_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_sep = false;

    for ch in name.trim().trim_start_matches('\u{feff}').chars() {
        if ch.is_whitespace() || matches!(ch, '-' | '.' | '/' | '_') {
            pending_sep = true;
            continue;
        }
        if pending_sep && !out.is_empty() {
            out.push('_');
        }
        pending_sep = false;
        out.extend(ch.to_lowercase());
    }

    out
}

/* =========================
   Registros y batches
   ========================= */

/// Fila tipada; las posiciones siguen el orden del esquema del batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record(pub Vec<Value>);

impl Record {
    pub fn get<'a>(&'a self, schema: &Schema, column: &str) -> Option<&'a Value> {
        schema.index_of(column).and_then(|i| self.0.get(i))
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub interval: Interval,
    pub schema: Schema,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(interval: Interval, schema: Schema) -> Self {
        Self {
            interval,
            schema,
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Vista de una fila como pares (columna, valor) en orden de esquema.
    pub fn row(&self, idx: usize) -> Option<Vec<(&str, &Value)>> {
        self.records.get(idx).map(|r| {
            self.schema
                .columns
                .iter()
                .map(|c| c.name.as_str())
                .zip(r.0.iter())
                .collect()
        })
    }
}
