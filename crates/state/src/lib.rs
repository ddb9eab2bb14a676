//! # Kestrel State
//!
//! Process-scoped key/value state persistence. The main process keeps a
//! small set of flags and markers (window placement, restart markers,
//! update bookkeeping) in a single JSON file that is flushed when the
//! application shuts down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable key/value store for process-scoped state.
///
/// Reads and writes are synchronous against an in-memory map; `close`
/// flushes to disk once, at shutdown. After `close` the store keeps
/// serving reads but further writes are not persisted.
#[async_trait]
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value);

    fn remove(&self, key: &str);

    /// Flush pending writes. Called once during shutdown.
    async fn close(&self) -> Result<(), StateError>;

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|value| value.as_bool())
    }

    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key)
            .and_then(|value| value.as_str().map(str::to_string))
    }
}

/// JSON-file-backed state store.
pub struct FileStateStore {
    path: PathBuf,
    data: RwLock<HashMap<String, Value>>,
    dirty: AtomicBool,
}

impl FileStateStore {
    /// Opens the store, loading the backing file if it exists. A missing
    /// or unparseable file yields an empty store: state is best-effort
    /// bookkeeping and must never prevent startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();

        let data = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, Value>>(&contents) {
                Ok(data) => data,
                Err(err) => {
                    warn!(path = %path.display(), "discarding unparseable state file: {err}");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(StateError::Read { path, source }),
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
    }

    fn remove(&self, key: &str) {
        if self.data.write().remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    async fn close(&self) -> Result<(), StateError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let contents = {
            let data = self.data.read();
            serde_json::to_string_pretty(&*data).unwrap_or_else(|_| String::from("{}"))
        };

        tokio::fs::write(&self.path, contents)
            .await
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

/// In-memory state store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStateStore {
    data: RwLock<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.data.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.data.write().remove(key);
    }

    async fn close(&self) -> Result<(), StateError> {
        Ok(())
    }
}
