//! Registered datasets, shared between the controller and loader threads

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::core::error::Error;
use crate::core::types::{DatasetId, Result};
use crate::hierarchy::Hierarchy;

/// Registration record of one dataset
#[derive(Debug)]
pub struct Dataset {
    id: DatasetId,
    hierarchy: Hierarchy,
    stream_path: PathBuf,
}

impl Dataset {
    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Primitive stream file backing this dataset
    pub fn stream_path(&self) -> &Path {
        &self.stream_path
    }

    pub fn node_byte_size(&self) -> usize {
        self.hierarchy.node_byte_size()
    }
}

/// Append-only list of datasets; ids are dense and never reused.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    datasets: RwLock<Vec<Arc<Dataset>>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the hierarchy at `hierarchy_path` and register it with its stream file.
    pub fn register(&self, hierarchy_path: &Path, stream_path: &Path) -> Result<DatasetId> {
        let hierarchy = Hierarchy::load(hierarchy_path)?;
        self.register_hierarchy(hierarchy, stream_path)
    }

    /// Register an already loaded hierarchy.
    ///
    /// Fails when the stream file is missing or too short for the
    /// node count the hierarchy declares.
    pub fn register_hierarchy(&self, hierarchy: Hierarchy, stream_path: &Path) -> Result<DatasetId> {
        let stream_len = std::fs::metadata(stream_path)?.len();
        let required = hierarchy.node_count() as u64 * hierarchy.node_byte_size() as u64;
        if stream_len < required {
            return Err(Error::Config(format!(
                "{} holds {} bytes, hierarchy requires {}",
                stream_path.display(),
                stream_len,
                required
            )));
        }

        let mut datasets = self.datasets.write().map_err(|_| poisoned())?;
        let id = datasets.len() as DatasetId;
        log::info!(
            "Registered dataset {} ({} nodes, fan {}, {} bytes/node) from {}",
            id,
            hierarchy.node_count(),
            hierarchy.fan_factor(),
            hierarchy.node_byte_size(),
            stream_path.display()
        );
        datasets.push(Arc::new(Dataset {
            id,
            hierarchy,
            stream_path: stream_path.to_path_buf(),
        }));
        Ok(id)
    }

    pub fn get(&self, id: DatasetId) -> Option<Arc<Dataset>> {
        self.datasets.read().ok()?.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.datasets.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all registered datasets
    pub fn all(&self) -> Vec<Arc<Dataset>> {
        self.datasets.read().map(|d| d.clone()).unwrap_or_default()
    }
}

fn poisoned() -> Error {
    Error::Config("dataset registry lock poisoned".into())
}
