use serde::{Deserialize, Serialize};

use crate::record::Interval;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResults {
    pub pipeline_id: String,
    pub interval: Interval,
    /// Raíz del almacenamiento de salida
    pub root: String,
    /// Archivos de partición visibles del intervalo, relativos a `root`
    pub files: Vec<String>,
}
