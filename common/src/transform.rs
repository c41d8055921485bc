use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::record::{Batch, Column, ColumnType, Record, Schema, Value};

/* =========================
   Definición (deserializable desde la config)
   ========================= */

/// Paso de transformación. El orden de la lista es significativo: un paso
/// puede usar columnas creadas por pasos anteriores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Rename {
        from: String,
        to: String,
    },
    Derive {
        column: String,
        expr: Expr,
    },
    Cast {
        column: String,
        to: ColumnType,
    },
    Filter {
        column: String,
        cmp: CmpOp,
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Col(String),
    Lit(serde_json::Value),
    Year(Box<Expr>),
    Month(Box<Expr>),
    Day(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Concat(Vec<Expr>),
    Upper(Box<Expr>),
    Lower(Box<Expr>),
}

impl Expr {
    pub fn col(name: &str) -> Expr {
        Expr::Col(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    IsNull,
    NotNull,
}

/* =========================
   Forma compilada
   ========================= */

#[derive(Debug, Clone, Copy)]
enum DatePart {
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
}

/// Expresión con columnas resueltas a posiciones.
#[derive(Debug, Clone)]
enum Bound {
    Col(usize),
    Lit(Value),
    DatePart(DatePart, Box<Bound>),
    Arith(Arith, Box<Bound>, Box<Bound>),
    Concat(Vec<Bound>),
    Upper(Box<Bound>),
    Lower(Box<Bound>),
}

#[derive(Debug, Clone)]
enum Compiled {
    Rename,
    Derive {
        target: Option<usize>,
        expr: Bound,
    },
    Cast {
        idx: usize,
        column: String,
        to: ColumnType,
    },
    Filter {
        idx: usize,
        cmp: CmpOp,
        value: Value,
    },
}

/// Lista fija de pasos compilada contra un esquema de entrada. Cada paso es
/// puro: la misma entrada produce siempre la misma salida.
#[derive(Debug, Clone)]
pub struct Transformer {
    steps: Vec<Compiled>,
    input: Schema,
    output: Schema,
}

impl Transformer {
    /// Valida y compila los pasos. Columnas desconocidas o nombres repetidos
    /// fallan aquí, antes de tocar una sola fila.
    pub fn new(steps: &[Step], input: &Schema) -> Result<Self, TransformError> {
        let mut schema = input.clone();
        let mut compiled = Vec::with_capacity(steps.len());

        for step in steps {
            compiled.push(compile_step(step, &mut schema)?);
        }

        Ok(Self {
            steps: compiled,
            input: input.clone(),
            output: schema,
        })
    }

    pub fn input_schema(&self) -> &Schema {
        &self.input
    }

    pub fn output_schema(&self) -> &Schema {
        &self.output
    }

    pub fn transform(&self, batch: Batch) -> Result<Batch, TransformError> {
        if batch.schema != self.input {
            return Err(TransformError::InvalidExpr(format!(
                "batch schema {:?} does not match transformer input {:?}",
                batch.schema.names(),
                self.input.names()
            )));
        }

        let mut records = batch.records;
        for step in &self.steps {
            records = apply_step(step, records)?;
        }

        Ok(Batch {
            interval: batch.interval,
            schema: self.output.clone(),
            records,
        })
    }
}

fn index(schema: &Schema, name: &str) -> Result<usize, TransformError> {
    schema
        .index_of(name)
        .ok_or_else(|| TransformError::UnknownColumn(name.to_string()))
}

fn compile_step(step: &Step, schema: &mut Schema) -> Result<Compiled, TransformError> {
    match step {
        Step::Rename { from, to } => {
            let idx = index(schema, from)?;
            if from != to && schema.index_of(to).is_some() {
                return Err(TransformError::DuplicateColumn(to.clone()));
            }
            schema.columns[idx].name = to.clone();
            Ok(Compiled::Rename)
        }
        Step::Derive { column, expr } => {
            let (bound, ty, nullable) = bind(expr, schema)?;
            let target = schema.index_of(column);
            let col = Column {
                name: column.clone(),
                ty,
                nullable,
            };
            match target {
                Some(i) => schema.columns[i] = col,
                None => schema.columns.push(col),
            }
            Ok(Compiled::Derive {
                target,
                expr: bound,
            })
        }
        Step::Cast { column, to } => {
            let idx = index(schema, column)?;
            schema.columns[idx].ty = *to;
            Ok(Compiled::Cast {
                idx,
                column: column.clone(),
                to: *to,
            })
        }
        Step::Filter { column, cmp, value } => {
            let idx = index(schema, column)?;
            let ty = schema.columns[idx].ty;
            let value = match cmp {
                CmpOp::IsNull | CmpOp::NotNull => Value::Null,
                _ => {
                    let raw = value.as_ref().ok_or_else(|| {
                        TransformError::InvalidExpr(format!("filter on '{column}' needs a value"))
                    })?;
                    match Value::coerce_json(raw, ty) {
                        Ok(Some(v)) => v,
                        _ => {
                            return Err(TransformError::InvalidExpr(format!(
                                "filter value {raw} is not a valid {ty}"
                            )))
                        }
                    }
                }
            };
            Ok(Compiled::Filter {
                idx,
                cmp: *cmp,
                value,
            })
        }
    }
}

/// Resuelve columnas y deduce (tipo, nullable) de la expresión.
fn bind(expr: &Expr, schema: &Schema) -> Result<(Bound, ColumnType, bool), TransformError> {
    match expr {
        Expr::Col(name) => {
            let idx = index(schema, name)?;
            let c = &schema.columns[idx];
            Ok((Bound::Col(idx), c.ty, c.nullable))
        }
        Expr::Lit(raw) => {
            let v = literal(raw)?;
            let ty = v
                .column_type()
                .ok_or_else(|| TransformError::InvalidExpr("null literal".into()))?;
            Ok((Bound::Lit(v), ty, false))
        }
        Expr::Year(e) | Expr::Month(e) | Expr::Day(e) => {
            let (b, ty, nullable) = bind(e, schema)?;
            if ty != ColumnType::Date {
                return Err(TransformError::InvalidExpr(format!(
                    "date part of a {ty} expression"
                )));
            }
            let part = match expr {
                Expr::Year(_) => DatePart::Year,
                Expr::Month(_) => DatePart::Month,
                _ => DatePart::Day,
            };
            Ok((Bound::DatePart(part, Box::new(b)), ColumnType::Int, nullable))
        }
        Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
            let (ba, ta, na) = bind(a, schema)?;
            let (bb, tb, nb) = bind(b, schema)?;
            let numeric = |t: ColumnType| matches!(t, ColumnType::Int | ColumnType::Float);
            if !numeric(ta) || !numeric(tb) {
                return Err(TransformError::InvalidExpr(format!(
                    "arithmetic on {ta} and {tb}"
                )));
            }
            let op = match expr {
                Expr::Add(..) => Arith::Add,
                Expr::Sub(..) => Arith::Sub,
                Expr::Mul(..) => Arith::Mul,
                _ => Arith::Div,
            };
            let (ty, nullable) = match op {
                Arith::Div => (ColumnType::Float, true),
                _ if ta == ColumnType::Int && tb == ColumnType::Int => (ColumnType::Int, true),
                _ => (ColumnType::Float, na || nb),
            };
            Ok((Bound::Arith(op, Box::new(ba), Box::new(bb)), ty, nullable))
        }
        Expr::Concat(parts) => {
            let mut bound = Vec::with_capacity(parts.len());
            let mut nullable = false;
            for p in parts {
                let (b, _, n) = bind(p, schema)?;
                nullable |= n;
                bound.push(b);
            }
            Ok((Bound::Concat(bound), ColumnType::String, nullable))
        }
        Expr::Upper(e) | Expr::Lower(e) => {
            let (b, ty, nullable) = bind(e, schema)?;
            if ty != ColumnType::String {
                return Err(TransformError::InvalidExpr(format!(
                    "case conversion of a {ty} expression"
                )));
            }
            let bound = match expr {
                Expr::Upper(_) => Bound::Upper(Box::new(b)),
                _ => Bound::Lower(Box::new(b)),
            };
            Ok((bound, ColumnType::String, nullable))
        }
    }
}

fn literal(raw: &serde_json::Value) -> Result<Value, TransformError> {
    use serde_json::Value as J;
    match raw {
        J::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Int(i)),
            None => n
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| TransformError::InvalidExpr(format!("bad literal {raw}"))),
        },
        J::String(s) => Ok(Value::Str(s.clone())),
        other => Err(TransformError::InvalidExpr(format!(
            "unsupported literal {other}"
        ))),
    }
}

fn apply_step(step: &Compiled, records: Vec<Record>) -> Result<Vec<Record>, TransformError> {
    match step {
        Compiled::Rename => Ok(records),
        Compiled::Derive { target, expr } => Ok(records
            .into_iter()
            .map(|mut r| {
                let v = eval(expr, &r);
                match target {
                    Some(i) => r.0[*i] = v,
                    None => r.0.push(v),
                }
                r
            })
            .collect()),
        Compiled::Cast { idx, column, to } => records
            .into_iter()
            .map(|mut r| {
                let v = &r.0[*idx];
                let cast = v.cast(*to).ok_or_else(|| TransformError::Cast {
                    column: column.clone(),
                    value: v.to_string(),
                    target: to.to_string(),
                })?;
                r.0[*idx] = cast;
                Ok(r)
            })
            .collect(),
        Compiled::Filter { idx, cmp, value } => Ok(records
            .into_iter()
            .filter(|r| predicate_holds(&r.0[*idx], *cmp, value))
            .collect()),
    }
}

fn predicate_holds(v: &Value, cmp: CmpOp, target: &Value) -> bool {
    use std::cmp::Ordering::*;
    match cmp {
        CmpOp::IsNull => v.is_null(),
        CmpOp::NotNull => !v.is_null(),
        _ => match v.compare(target) {
            None => false,
            Some(ord) => match cmp {
                CmpOp::Eq => ord == Equal,
                CmpOp::Ne => ord != Equal,
                CmpOp::Gt => ord == Greater,
                CmpOp::Ge => ord != Less,
                CmpOp::Lt => ord == Less,
                CmpOp::Le => ord != Greater,
                CmpOp::IsNull | CmpOp::NotNull => false,
            },
        },
    }
}

fn eval(expr: &Bound, r: &Record) -> Value {
    match expr {
        Bound::Col(i) => r.0[*i].clone(),
        Bound::Lit(v) => v.clone(),
        Bound::DatePart(part, e) => match eval(e, r) {
            Value::Date(d) => Value::Int(match part {
                DatePart::Year => d.year() as i64,
                DatePart::Month => d.month() as i64,
                DatePart::Day => d.day() as i64,
            }),
            _ => Value::Null,
        },
        Bound::Arith(op, a, b) => arith(*op, eval(a, r), eval(b, r)),
        Bound::Concat(parts) => {
            let mut out = String::new();
            for p in parts {
                match eval(p, r) {
                    Value::Null => return Value::Null,
                    v => out.push_str(&v.to_string()),
                }
            }
            Value::Str(out)
        }
        Bound::Upper(e) => match eval(e, r) {
            Value::Str(s) => Value::Str(s.to_uppercase()),
            _ => Value::Null,
        },
        Bound::Lower(e) => match eval(e, r) {
            Value::Str(s) => Value::Str(s.to_lowercase()),
            _ => Value::Null,
        },
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn arith(op: Arith, a: Value, b: Value) -> Value {
    if let (Value::Int(x), Value::Int(y)) = (&a, &b) {
        let res = match op {
            Arith::Add => x.checked_add(*y),
            Arith::Sub => x.checked_sub(*y),
            Arith::Mul => x.checked_mul(*y),
            Arith::Div => {
                return if *y == 0 {
                    Value::Null
                } else {
                    Value::Float(*x as f64 / *y as f64)
                }
            }
        };
        return res.map(Value::Int).unwrap_or(Value::Null);
    }

    let (Some(x), Some(y)) = (as_f64(&a), as_f64(&b)) else {
        return Value::Null;
    };
    match op {
        Arith::Add => Value::Float(x + y),
        Arith::Sub => Value::Float(x - y),
        Arith::Mul => Value::Float(x * y),
        Arith::Div if y == 0.0 => Value::Null,
        Arith::Div => Value::Float(x / y),
    }
}
