//! Key/value storage backends for credentials and persisted connectivity flags.

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("value not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Namespaced string key/value storage.
pub trait KeyValueStore: Send + Sync {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError>;

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set_value(namespace, key, value)
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
        (**self).get_value(namespace, key)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        (**self).delete_value(namespace, key)
    }
}

/// Process-local store. Used as the ephemeral tier and in tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl KeyValueStore for InMemoryStore {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.get(&(namespace.to_owned(), key.to_owned()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        if data
            .remove(&(namespace.to_owned(), key.to_owned()))
            .is_none()
        {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Durable store backed by one JSON file per namespace under a root directory.
///
/// Writes go to a temp file first and are renamed into place.
#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_component(namespace)))
    }

    fn load(&self, namespace: &str) -> Result<HashMap<String, String>, StoreError> {
        let path = self.namespace_path(namespace);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "failed reading {}: {err}",
                    path.display()
                )));
            }
        };

        serde_json::from_str(&raw)
            .map_err(|err| StoreError::Backend(format!("failed parsing {}: {err}", path.display())))
    }

    fn save(&self, namespace: &str, values: &HashMap<String, String>) -> Result<(), StoreError> {
        let path = self.namespace_path(namespace);
        fs::create_dir_all(&self.root).map_err(|err| {
            StoreError::Unavailable(format!(
                "failed creating store directory {}: {err}",
                self.root.display()
            ))
        })?;

        let encoded =
            serde_json::to_vec(values).map_err(|err| StoreError::Backend(err.to_string()))?;
        let temp_path = temp_path_for(&path);
        fs::write(&temp_path, encoded).map_err(|err| {
            StoreError::Unavailable(format!(
                "failed writing temp file {}: {err}",
                temp_path.display()
            ))
        })?;

        if let Err(rename_err) = fs::rename(&temp_path, &path) {
            // Windows does not allow replacing existing files via rename.
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    let _ = fs::remove_file(&temp_path);
                    return Err(StoreError::Backend(format!(
                        "failed replacing {} after rename error ({rename_err}): {err}",
                        path.display()
                    )));
                }
            }
            fs::rename(&temp_path, &path).map_err(|err| {
                let _ = fs::remove_file(&temp_path);
                StoreError::Backend(format!("failed writing {}: {err}", path.display()))
            })?;
        }

        debug!(path = %path.display(), entries = values.len(), "persisted store namespace");
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn set_value(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let mut values = self.load(namespace)?;
        values.insert(key.to_owned(), value.to_owned());
        self.save(namespace, &values)
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<String, StoreError> {
        self.load(namespace)?
            .remove(key)
            .ok_or(StoreError::NotFound)
    }

    fn delete_value(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let mut values = self.load(namespace)?;
        if values.remove(key).is_none() {
            return Err(StoreError::NotFound);
        }
        self.save(namespace, &values)
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("store.json");
    parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn file_component(namespace: &str) -> String {
    let cleaned: String = namespace
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_owned()
    } else {
        cleaned
    }
}

/// Store view bound to one namespace.
#[derive(Clone)]
pub struct ScopedStore<S: KeyValueStore> {
    inner: S,
    namespace: String,
}

impl<S: KeyValueStore> ScopedStore<S> {
    pub fn new(inner: S, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set_value(&self.namespace, key, value)
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.inner.get_value(&self.namespace, key)
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete_value(&self.namespace, key)
    }

    /// Delete treating an absent key as success.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.delete(key) {
            Ok(()) | Err(StoreError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Store that fails every operation; simulates a disabled or full storage backend.
#[derive(Debug, Clone, Default)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl KeyValueStore for UnavailableStore {
    fn set_value(&self, _namespace: &str, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    fn get_value(&self, _namespace: &str, _key: &str) -> Result<String, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }

    fn delete_value(&self, _namespace: &str, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}
