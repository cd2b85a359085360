#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// Persistence seam. The stores depend only on this interface; the host
/// application decides where snapshots live. Implementations must round-trip
/// every entity field losslessly, including phase-history order.
pub trait SnapshotAdapter<T> {
    fn load(&self) -> Result<Vec<T>, StoreError>;
    fn save(&self, rows: &[T]) -> Result<(), StoreError>;
}

/// Flat JSON file, one array of entities.
#[derive(Debug, Clone)]
pub struct JsonFileAdapter {
    path: PathBuf,
}

impl JsonFileAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl<T> SnapshotAdapter<T> for JsonFileAdapter
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Vec<T>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path).map_err(|err| StoreError::Adapter {
            message: format!("snapshot read failed: {}", err),
        })?;
        serde_json::from_str(&raw).map_err(|err| StoreError::Adapter {
            message: format!("snapshot decode failed: {}", err),
        })
    }

    fn save(&self, rows: &[T]) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(rows).map_err(|err| StoreError::Adapter {
            message: format!("snapshot encode failed: {}", err),
        })?;
        fs::write(&self.path, raw).map_err(|err| StoreError::Adapter {
            message: format!("snapshot write failed: {}", err),
        })
    }
}

/// Buffer-backed adapter for tests and embedded use. Serializes through the
/// same JSON codec as the file adapter so round-trip coverage is identical.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    buf: RefCell<Option<String>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> SnapshotAdapter<T> for InMemoryAdapter
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Vec<T>, StoreError> {
        match self.buf.borrow().as_ref() {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|err| StoreError::Adapter {
                message: format!("snapshot decode failed: {}", err),
            }),
        }
    }

    fn save(&self, rows: &[T]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(rows).map_err(|err| StoreError::Adapter {
            message: format!("snapshot encode failed: {}", err),
        })?;
        *self.buf.borrow_mut() = Some(raw);
        Ok(())
    }
}
