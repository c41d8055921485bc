// scheduler/src/state.rs

use common::{sink::SinkWriter, PipelineConfig, Runner};
use std::{path::PathBuf, sync::Arc};

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
    // para listar las particiones visibles de un intervalo
    pub sink: SinkWriter,
    pub sink_root: PathBuf,
}

impl AppState {
    pub fn new(runner: Arc<Runner>, sink: SinkWriter, sink_root: PathBuf) -> Self {
        Self {
            runner,
            sink,
            sink_root,
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Result<Self, common::ConfigError> {
        Ok(Self::new(
            Arc::new(cfg.build_runner()?),
            cfg.sink_writer()?,
            cfg.sink.root.clone(),
        ))
    }
}
