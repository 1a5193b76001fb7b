use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::domain::{ConfigRecord, RequestId};
use crate::error::HobsError;

/// Opaque object storage: put-by-key, get-by-key and list-by-prefix.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, content: &[u8]) -> Result<(), HobsError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, HobsError>;
    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, HobsError>;
}

/// A bucket laid out on the local filesystem, one file per key.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: Utf8PathBuf,
}

impl FsObjectStore {
    pub fn new(mirror_root: &Utf8Path, bucket: &str) -> Self {
        Self {
            root: mirror_root.join(bucket),
        }
    }

    fn key_path(&self, key: &str) -> Result<Utf8PathBuf, HobsError> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(HobsError::Filesystem(format!("invalid object key: {key}")));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, content: &[u8]) -> Result<(), HobsError> {
        let path = self.key_path(key)?;
        let io_error = |source| HobsError::ObjectStore {
            key: key.to_string(),
            source,
        };
        let parent = path
            .parent()
            .ok_or_else(|| HobsError::Filesystem(format!("invalid object key: {key}")))?;
        fs::create_dir_all(parent.as_std_path()).map_err(io_error)?;
        let mut temp = Builder::new()
            .prefix(".hobs-object")
            .tempfile_in(parent.as_std_path())
            .map_err(io_error)?;
        temp.write_all(content).map_err(io_error)?;
        temp.persist(path.as_std_path())
            .map_err(|err| io_error(err.error))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, HobsError> {
        let path = self.key_path(key)?;
        if !path.as_std_path().is_file() {
            return Err(HobsError::ObjectNotFound(key.to_string()));
        }
        fs::read(path.as_std_path()).map_err(|source| HobsError::ObjectStore {
            key: key.to_string(),
            source,
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, HobsError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut keys = walk_files(self.root.as_std_path())?
            .into_iter()
            .filter_map(|path| {
                let relative = path.strip_prefix(self.root.as_std_path()).ok()?;
                let key = relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                Some(key)
            })
            .filter(|key| key.starts_with(prefix))
            .filter(|key| {
                !key.rsplit('/')
                    .next()
                    .map(|name| name.starts_with(".hobs-object"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }
}

/// Config records of a request, one JSON blob each under `<base>/<request_id>/`.
pub struct ConfigMirror<'a, O: ObjectStore + ?Sized> {
    store: &'a O,
    base_folder: &'a str,
}

impl<'a, O: ObjectStore + ?Sized> ConfigMirror<'a, O> {
    pub fn new(store: &'a O, base_folder: &'a str) -> Self {
        Self { store, base_folder }
    }

    pub fn request_prefix(&self, request_id: &RequestId) -> String {
        if self.base_folder.is_empty() {
            format!("{request_id}/")
        } else {
            format!("{}/{request_id}/", self.base_folder)
        }
    }

    pub fn record_key(&self, request_id: &RequestId, record: &ConfigRecord) -> String {
        let name = record.blob_name().replace(['/', '\\'], "_");
        format!("{}{name}.json", self.request_prefix(request_id))
    }

    pub fn save(
        &self,
        request_id: &RequestId,
        records: &[ConfigRecord],
    ) -> Result<Vec<String>, HobsError> {
        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let key = self.record_key(request_id, record);
            let content = serde_json::to_vec(record).map_err(|source| HobsError::MirrorEncode {
                key: key.clone(),
                source,
            })?;
            self.store.put(&key, &content)?;
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn load(&self, request_id: &RequestId) -> Result<Vec<ConfigRecord>, HobsError> {
        let prefix = self.request_prefix(request_id);
        self.store
            .list(&prefix)?
            .into_iter()
            .map(|key| {
                let content = self.store.get(&key)?;
                serde_json::from_slice(&content)
                    .map_err(|source| HobsError::MirrorPayload { key, source })
            })
            .collect()
    }
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>, HobsError> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| HobsError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HobsError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}
