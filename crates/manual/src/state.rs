//! Bootstrap state persistence.
//!
//! The bootstrap state record lists the instances that make up an
//! environment's controller. Its presence in the environment's storage is
//! what marks the environment as bootstrapped, so it is only ever written
//! whole and only after the remote install has succeeded.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::hardware::HardwareCharacteristics;

/// Well-known storage name of the bootstrap state record.
pub const STATE_FILE: &str = "provider-state";

/// Errors from a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Nothing is stored under the name.
    #[error("file {0:?} not found")]
    NotFound(String),

    /// The name cannot be used as a storage key.
    #[error("invalid storage name {0:?}")]
    InvalidName(String),

    /// Backend I/O failure.
    #[error("storage I/O error on {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors reading or writing the bootstrap state record.
#[derive(Error, Debug)]
pub enum StateError {
    /// No record exists; the environment has not been bootstrapped.
    #[error("environment is not bootstrapped")]
    NotBootstrapped,

    /// The record exists but cannot be decoded.
    #[error("error unmarshalling bootstrap state: {0}")]
    Corrupt(#[from] serde_yaml::Error),

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Key-addressed blob storage owned by an environment.
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Read the blob stored under `name`.
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace the blob stored under `name`.
    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove the blob stored under `name`. Removing a missing name succeeds.
    async fn remove(&self, name: &str) -> Result<(), StorageError>;
}

/// Instance identifier of a controller machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The bootstrap state record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapState {
    /// Instances running the controller, in bootstrap order.
    #[serde(rename = "state-instances")]
    pub state_instances: Vec<InstanceId>,
    /// Hardware of each instance, parallel to `state_instances`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub characteristics: Vec<HardwareCharacteristics>,
}

/// Write the record, replacing any existing one.
///
/// # Errors
/// Returns an error if the record cannot be encoded or stored.
pub async fn save_state(storage: &dyn StateStorage, state: &BootstrapState) -> Result<(), StateError> {
    let data = serde_yaml::to_string(state)?;
    storage.put(STATE_FILE, data.as_bytes()).await?;
    info!(instances = ?state.state_instances, "Saved bootstrap state");
    Ok(())
}

/// Read the record.
///
/// # Errors
/// Returns [`StateError::NotBootstrapped`] if no record exists.
pub async fn load_state(storage: &dyn StateStorage) -> Result<BootstrapState, StateError> {
    let data = match storage.get(STATE_FILE).await {
        Ok(data) => data,
        Err(StorageError::NotFound(_)) => return Err(StateError::NotBootstrapped),
        Err(e) => return Err(e.into()),
    };
    let state: BootstrapState = serde_yaml::from_slice(&data)?;
    debug!(instances = ?state.state_instances, "Loaded bootstrap state");
    Ok(state)
}

/// Delete the record if present.
///
/// # Errors
/// Returns an error if the backend fails.
pub async fn remove_state(storage: &dyn StateStorage) -> Result<(), StateError> {
    storage.remove(STATE_FILE).await?;
    info!("Removed bootstrap state");
    Ok(())
}

/// Directory-backed storage, one file per name.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

fn io_err(name: &str, source: std::io::Error) -> StorageError {
    StorageError::Io {
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl StateStorage for FileStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(io_err(name, e)),
        }
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path(name)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(name, e))?;

        // Write beside the target and rename so readers never see a partial record.
        let tmp = self.dir.join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(name, e));
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_err(name, e));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        let path = self.path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(name, e)),
        }
    }
}

/// In-process storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stored names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn put(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.lock().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.lock().remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> BootstrapState {
        BootstrapState {
            state_instances: vec![InstanceId::new("manual:")],
            characteristics: vec![HardwareCharacteristics::with_arch("amd64")],
        }
    }

    #[tokio::test]
    async fn test_load_missing_is_not_bootstrapped() {
        let storage = MemoryStorage::new();
        let err = load_state(&storage).await.unwrap_err();
        assert!(matches!(err, StateError::NotBootstrapped));
    }

    #[tokio::test]
    async fn test_save_load_remove_memory() {
        let storage = MemoryStorage::new();
        save_state(&storage, &sample_state()).await.unwrap();
        assert_eq!(storage.names(), vec![STATE_FILE.to_string()]);
        assert_eq!(load_state(&storage).await.unwrap(), sample_state());

        remove_state(&storage).await.unwrap();
        assert!(matches!(
            load_state(&storage).await,
            Err(StateError::NotBootstrapped)
        ));
        // Removing again is not an error.
        remove_state(&storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("storage"));
        save_state(&storage, &sample_state()).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("storage").join(STATE_FILE)).unwrap();
        assert!(raw.contains("state-instances"));
        assert!(raw.contains("manual:"));

        assert_eq!(load_state(&storage).await.unwrap(), sample_state());
        remove_state(&storage).await.unwrap();
        assert!(!dir.path().join("storage").join(STATE_FILE).exists());
        remove_state(&storage).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_storage_overwrite_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.put(STATE_FILE, b"state-instances: [a]\n").await.unwrap();
        storage.put(STATE_FILE, b"state-instances: [b]\n").await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let state = load_state(&storage).await.unwrap();
        assert_eq!(state.state_instances, vec![InstanceId::new("b")]);
    }

    #[tokio::test]
    async fn test_file_storage_rejects_path_names() {
        let storage = FileStorage::new("/tmp/unused");
        assert!(matches!(
            storage.get("../etc/passwd").await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let storage = MemoryStorage::new();
        storage.put(STATE_FILE, b"state-instances: {").await.unwrap();
        assert!(matches!(
            load_state(&storage).await,
            Err(StateError::Corrupt(_))
        ));
    }
}
