use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use glob::{glob, Pattern};

use crate::error::WriteError;

/// Frontera con el almacenamiento de objetos. Las rutas son claves
/// relativas separadas por `/`.
///
/// `atomic_rename` reemplaza el destino si ya existe (last-writer-wins);
/// la exclusión entre escritores del mismo intervalo la da el runner.
pub trait Storage: Send + Sync {
    fn put(&self, path: &str, data: &[u8]) -> Result<(), WriteError>;

    fn get(&self, path: &str) -> Result<Vec<u8>, WriteError>;

    /// Todas las claves de archivo bajo `prefix` (vacío = todo), ordenadas.
    fn list(&self, prefix: &str) -> Result<Vec<String>, WriteError>;

    fn atomic_rename(&self, staging_path: &str, final_path: &str) -> Result<(), WriteError>;

    fn delete(&self, path: &str) -> Result<(), WriteError>;

    fn delete_prefix(&self, prefix: &str) -> Result<(), WriteError>;
}

fn io_err(path: &Path, source: io::Error) -> WriteError {
    WriteError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Almacenamiento sobre un directorio local. `rename` dentro del mismo
/// sistema de archivos es atómico, que es lo que necesita el sink.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, WriteError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        let mut p = self.root.clone();
        for part in key.split('/').filter(|s| !s.is_empty()) {
            p.push(part);
        }
        p
    }

    fn ensure_parent(path: &Path) -> Result<(), WriteError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        Ok(())
    }
}

impl Storage for LocalStorage {
    fn put(&self, path: &str, data: &[u8]) -> Result<(), WriteError> {
        let target = self.resolve(path);
        Self::ensure_parent(&target)?;

        let mut f = File::create(&target).map_err(|e| io_err(&target, e))?;
        f.write_all(data).map_err(|e| io_err(&target, e))?;
        f.sync_all().map_err(|e| io_err(&target, e))?;
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, WriteError> {
        let target = self.resolve(path);
        fs::read(&target).map_err(|e| io_err(&target, e))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, WriteError> {
        let base = self.resolve(prefix);
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let pattern = format!("{}/**/*", Pattern::escape(&base.to_string_lossy()));
        let entries = glob(&pattern).map_err(|e| WriteError::Encode(e.to_string()))?;

        let mut out = Vec::new();
        for entry in entries.flatten() {
            if !entry.is_file() {
                continue;
            }
            if let Ok(rel) = entry.strip_prefix(&self.root) {
                let key: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect();
                out.push(key.join("/"));
            }
        }
        out.sort();
        Ok(out)
    }

    fn atomic_rename(&self, staging_path: &str, final_path: &str) -> Result<(), WriteError> {
        let from = self.resolve(staging_path);
        let to = self.resolve(final_path);
        Self::ensure_parent(&to)?;
        fs::rename(&from, &to).map_err(|e| io_err(&to, e))
    }

    fn delete(&self, path: &str) -> Result<(), WriteError> {
        let target = self.resolve(path);
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&target, e)),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<(), WriteError> {
        let target = self.resolve(prefix);
        if target == self.root {
            return Err(WriteError::Encode("refusing to delete storage root".into()));
        }
        match fs::remove_dir_all(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&target, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = std::env::temp_dir().join("etl_storage_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    #[test]
    fn put_get_y_list_recursivo() {
        let st = LocalStorage::new(temp_dir("basic")).unwrap();
        st.put("year=2023/part-a.csv", b"x").unwrap();
        st.put("year=2022/part-b.csv", b"y").unwrap();
        st.put("_staging/tmp/part-c.csv", b"z").unwrap();

        assert_eq!(st.get("year=2023/part-a.csv").unwrap(), b"x");
        assert_eq!(
            st.list("").unwrap(),
            vec![
                "_staging/tmp/part-c.csv",
                "year=2022/part-b.csv",
                "year=2023/part-a.csv"
            ]
        );
        assert_eq!(st.list("year=2023").unwrap(), vec!["year=2023/part-a.csv"]);
        assert!(st.list("nope").unwrap().is_empty());
    }

    #[test]
    fn atomic_rename_reemplaza_destino() {
        let st = LocalStorage::new(temp_dir("rename")).unwrap();
        st.put("final/part.csv", b"old").unwrap();
        st.put("_staging/s1/part.csv", b"new").unwrap();

        st.atomic_rename("_staging/s1/part.csv", "final/part.csv").unwrap();

        assert_eq!(st.get("final/part.csv").unwrap(), b"new");
        assert_eq!(st.list("_staging").unwrap().len(), 0);
    }

    #[test]
    fn delete_es_idempotente() {
        let st = LocalStorage::new(temp_dir("delete")).unwrap();
        st.put("a/b.csv", b"1").unwrap();
        st.delete("a/b.csv").unwrap();
        st.delete("a/b.csv").unwrap();
        st.delete_prefix("a").unwrap();
        st.delete_prefix("a").unwrap();
        assert!(st.delete_prefix("").is_err());
    }
}
