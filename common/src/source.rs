use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    io::{BufRead, BufReader, Lines},
    path::{Path, PathBuf},
};

use glob::glob;
use tracing::debug;

use crate::error::SourceError;
use crate::record::{Interval, RawRecord};

/// Secuencia perezosa y finita de registros crudos.
pub type RecordStream = Box<dyn Iterator<Item = Result<RawRecord, SourceError>> + Send>;

/// Origen externo de registros. `read` se puede llamar varias veces para el
/// mismo intervalo: cada llamada vuelve a empezar desde el principio.
pub trait RecordSource: Send + Sync {
    fn name(&self) -> &str;

    fn read(&self, interval: &Interval) -> Result<RecordStream, SourceError>;
}

/// Sustituye `{interval}` en la plantilla y resuelve globs.
/// Sin archivos → `SourceError::Unavailable`.
pub fn resolve_paths(template: &str, interval: &Interval) -> Result<Vec<PathBuf>, SourceError> {
    let pattern = template.replace("{interval}", &interval.to_string());

    if !pattern.contains(['*', '?', '[']) {
        let p = PathBuf::from(&pattern);
        if p.is_file() {
            return Ok(vec![p]);
        }
        return Err(SourceError::Unavailable(format!("no existe {pattern}")));
    }

    let entries = glob(&pattern)
        .map_err(|e| SourceError::Unavailable(format!("patrón inválido {pattern}: {e}")))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(SourceError::Unavailable(format!(
            "ningún archivo coincide con {pattern}"
        )));
    }
    Ok(paths)
}

fn open(path: &Path) -> Result<File, SourceError> {
    File::open(path)
        .map_err(|e| SourceError::Unavailable(format!("no se pudo abrir {}: {e}", path.display())))
}

/* =========================
   CSV con encabezado
   ========================= */

/// Archivos delimitados con fila de encabezado. Filas cortas se aceptan:
/// las celdas que faltan simplemente no aparecen en el registro.
#[derive(Debug, Clone)]
pub struct CsvSource {
    name: String,
    path_template: String,
    delimiter: u8,
}

impl CsvSource {
    pub fn new(path_template: &str) -> Self {
        Self {
            name: "csv".to_string(),
            path_template: path_template.to_string(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

impl RecordSource for CsvSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, interval: &Interval) -> Result<RecordStream, SourceError> {
        let paths = resolve_paths(&self.path_template, interval)?;
        debug!("csv source: {} archivo(s) para {}", paths.len(), interval);
        Ok(Box::new(CsvRows {
            paths: paths.into(),
            delimiter: self.delimiter,
            current: None,
        }))
    }
}

struct OpenCsv {
    path: String,
    headers: Vec<String>,
    rows: csv::StringRecordsIntoIter<File>,
}

struct CsvRows {
    paths: VecDeque<PathBuf>,
    delimiter: u8,
    current: Option<OpenCsv>,
}

impl CsvRows {
    fn open_next(&mut self) -> Option<Result<(), SourceError>> {
        let path = self.paths.pop_front()?;
        let file = match open(&path) {
            Ok(f) => f,
            Err(e) => return Some(Err(e)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(file);

        let headers = match reader.headers() {
            Ok(h) => h.iter().map(|s| s.to_string()).collect(),
            Err(e) => {
                return Some(Err(SourceError::Malformed {
                    path: path.display().to_string(),
                    detail: e.to_string(),
                }))
            }
        };

        self.current = Some(OpenCsv {
            path: path.display().to_string(),
            headers,
            rows: reader.into_records(),
        });
        Some(Ok(()))
    }
}

impl Iterator for CsvRows {
    type Item = Result<RawRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.open_next()? {
                    Ok(()) => {}
                    Err(e) => return Some(Err(e)),
                }
            }

            let cur = self.current.as_mut()?;
            match cur.rows.next() {
                Some(Ok(row)) => {
                    let mut obj = RawRecord::new();
                    for (idx, h) in cur.headers.iter().enumerate() {
                        if let Some(cell) = row.get(idx) {
                            obj.insert(h.clone(), serde_json::Value::String(cell.to_string()));
                        }
                    }
                    return Some(Ok(obj));
                }
                Some(Err(e)) => {
                    return Some(Err(SourceError::Malformed {
                        path: cur.path.clone(),
                        detail: e.to_string(),
                    }))
                }
                None => self.current = None,
            }
        }
    }
}

/* =========================
   JSONL: un objeto por línea
   ========================= */

#[derive(Debug, Clone)]
pub struct JsonlSource {
    name: String,
    path_template: String,
}

impl JsonlSource {
    pub fn new(path_template: &str) -> Self {
        Self {
            name: "jsonl".to_string(),
            path_template: path_template.to_string(),
        }
    }
}

impl RecordSource for JsonlSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, interval: &Interval) -> Result<RecordStream, SourceError> {
        let paths = resolve_paths(&self.path_template, interval)?;
        Ok(Box::new(JsonlRows {
            paths: paths.into(),
            current: None,
        }))
    }
}

struct JsonlRows {
    paths: VecDeque<PathBuf>,
    current: Option<(String, Lines<BufReader<File>>)>,
}

impl Iterator for JsonlRows {
    type Item = Result<RawRecord, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.paths.pop_front()?;
                match open(&path) {
                    Ok(f) => {
                        self.current = Some((path.display().to_string(), BufReader::new(f).lines()))
                    }
                    Err(e) => return Some(Err(e)),
                }
            }

            let (path, lines) = self.current.as_mut()?;
            match lines.next() {
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let parsed = serde_json::from_str::<serde_json::Value>(&line);
                    return Some(match parsed {
                        Ok(serde_json::Value::Object(obj)) => Ok(obj),
                        Ok(_) => Err(SourceError::Malformed {
                            path: path.clone(),
                            detail: "se esperaba un objeto JSON por línea".into(),
                        }),
                        Err(e) => Err(SourceError::Malformed {
                            path: path.clone(),
                            detail: e.to_string(),
                        }),
                    });
                }
                Some(Err(e)) => {
                    return Some(Err(SourceError::Unavailable(format!(
                        "error leyendo {path}: {e}"
                    ))))
                }
                None => self.current = None,
            }
        }
    }
}

/* =========================
   Fuente en memoria
   ========================= */

/// Fuente con filas fijas por intervalo. Un intervalo sin filas registradas
/// se comporta como un origen inexistente.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    rows: HashMap<Interval, Vec<RawRecord>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, interval: Interval, rows: Vec<RawRecord>) -> Self {
        self.rows.insert(interval, rows);
        self
    }
}

impl RecordSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn read(&self, interval: &Interval) -> Result<RecordStream, SourceError> {
        let rows = self
            .rows
            .get(interval)
            .cloned()
            .ok_or_else(|| SourceError::Unavailable(format!("sin datos para {interval}")))?;
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("etl_source_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn day(s: &str) -> Interval {
        s.parse().unwrap()
    }

    #[test]
    fn csv_source_lee_encabezados_y_filas_cortas() {
        let tmp = temp_dir("csv_basic");
        let path = tmp.join("orders-2023-01-01.csv");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "order_id,date,qty,price").unwrap();
        writeln!(f, "1,2023-01-01,2,10").unwrap();
        writeln!(f, "2,2023-01-01,bad").unwrap();

        let template = tmp.join("orders-{interval}.csv").display().to_string();
        let src = CsvSource::new(&template);
        let rows: Vec<RawRecord> = src
            .read(&day("2023-01-01"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["price"], serde_json::json!("10"));
        assert_eq!(rows[1]["qty"], serde_json::json!("bad"));
        assert!(!rows[1].contains_key("price"));
    }

    #[test]
    fn csv_source_se_puede_releer() {
        let tmp = temp_dir("csv_reread");
        let path = tmp.join("in.csv");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "a").unwrap();
        writeln!(f, "1").unwrap();

        let src = CsvSource::new(path.to_str().unwrap());
        let first: Vec<_> = src.read(&day("2023-01-01")).unwrap().collect();
        let second: Vec<_> = src.read(&day("2023-01-01")).unwrap().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn csv_source_glob_en_orden_de_ruta() {
        let tmp = temp_dir("csv_glob");
        for (name, v) in [("b.csv", "2"), ("a.csv", "1")] {
            let mut f = fs::File::create(tmp.join(name)).unwrap();
            writeln!(f, "v").unwrap();
            writeln!(f, "{v}").unwrap();
        }

        let template = tmp.join("*.csv").display().to_string();
        let rows: Vec<RawRecord> = CsvSource::new(&template)
            .read(&day("2023-01-01"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let vals: Vec<&str> = rows.iter().map(|r| r["v"].as_str().unwrap()).collect();
        assert_eq!(vals, vec!["1", "2"]);
    }

    #[test]
    fn archivo_inexistente_es_source_unavailable() {
        let tmp = temp_dir("missing");
        let template = tmp.join("nada-{interval}.csv").display().to_string();
        let res = CsvSource::new(&template).read(&day("2023-01-01"));
        assert!(matches!(res, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn jsonl_source_lee_un_objeto_por_linea() {
        let tmp = temp_dir("jsonl");
        let path = tmp.join("data.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "{}", r#"{"order_id":1,"qty":2}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, "{}", r#"{"order_id":2}"#).unwrap();

        let rows: Vec<RawRecord> = JsonlSource::new(path.to_str().unwrap())
            .read(&day("2023-01-01"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["qty"], serde_json::json!(2));
    }

    #[test]
    fn memory_source_sin_intervalo_falla() {
        let src = MemorySource::new().with_rows(day("2023-01-01"), vec![RawRecord::new()]);
        assert!(src.read(&day("2023-01-02")).is_err());
        assert_eq!(src.read(&day("2023-01-01")).unwrap().count(), 1);
    }
}
