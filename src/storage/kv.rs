// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Namespaced key-value persistence.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Durable key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns only once the value is durable.
    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()>;
}

/// One file per entry under `<root>/<namespace>/<key>`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create data directory {:?}", root))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        for part in [namespace, key] {
            if part.is_empty()
                || part.contains('/')
                || part.contains('\\')
                || part.starts_with('.')
            {
                bail!("Invalid storage name {:?}", part);
            }
        }
        Ok(self.root.join(namespace).join(key))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(namespace, key)?;
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(Some(bytes))
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path(namespace, key)?;
        let dir = self.root.join(namespace);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;

        // Write-then-rename so a crash leaves either the old or the new value.
        let tmp = dir.join(format!(".{}.tmp", key));
        {
            let mut file =
                fs::File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
            file.write_all(value)
                .with_context(|| format!("Failed to write {:?}", tmp))?;
            file.sync_all()
                .with_context(|| format!("Failed to sync {:?}", tmp))?;
        }
        fs::rename(&tmp, &path).with_context(|| format!("Failed to replace {:?}", path))?;

        debug!("Stored {}/{} ({} bytes)", namespace, key, value.len());
        Ok(())
    }
}

/// Volatile store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_vec());
        Ok(())
    }
}
