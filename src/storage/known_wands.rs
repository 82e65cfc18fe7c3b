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

//! Known wand storage.
//!
//! Records which wand public keys this installation has successfully
//! registered with the trust service. Every mutation is persisted before it
//! is reported as done.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::kv::KeyValueStore;

const NAMESPACE: &str = "wands";
const KEY: &str = "known_wands.json";

/// Known wands file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KnownWandsFile {
    /// File format version.
    version: u32,
    /// Public key (lowercase hex) to registration time.
    wands: BTreeMap<String, DateTime<Utc>>,
}

/// Index of registered wand public keys.
pub struct KnownWandsIndex {
    store: Arc<dyn KeyValueStore>,
    wands: BTreeMap<String, DateTime<Utc>>,
}

impl KnownWandsIndex {
    /// Load the index from `store`, starting empty if nothing is stored yet.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let wands = match store.get(NAMESPACE, KEY)? {
            Some(bytes) => {
                let file: KnownWandsFile = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse {}", KEY))?;
                file.wands
            }
            None => {
                debug!("No known wands stored, starting with empty index");
                BTreeMap::new()
            }
        };

        info!("Loaded {} known wand(s)", wands.len());
        Ok(Self { store, wands })
    }

    pub fn is_known(&self, public_key: &str) -> bool {
        self.wands.contains_key(&normalize(public_key))
    }

    pub fn registered_at(&self, public_key: &str) -> Option<DateTime<Utc>> {
        self.wands.get(&normalize(public_key)).copied()
    }

    pub fn len(&self) -> usize {
        self.wands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wands.is_empty()
    }

    pub fn entries(&self) -> Vec<(String, DateTime<Utc>)> {
        self.wands.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// Mark a key as registered. If persisting fails the index is left unchanged.
    pub fn mark_known(&mut self, public_key: &str) -> Result<()> {
        let key = normalize(public_key);
        let previous = self.wands.insert(key.clone(), Utc::now());

        if let Err(e) = self.save() {
            match previous {
                Some(at) => self.wands.insert(key, at),
                None => self.wands.remove(&key),
            };
            return Err(e);
        }

        info!("Marked wand {} as known", key);
        Ok(())
    }

    /// Remove a key. Returns whether it was present.
    pub fn forget(&mut self, public_key: &str) -> Result<bool> {
        let key = normalize(public_key);
        let Some(at) = self.wands.remove(&key) else {
            return Ok(false);
        };

        if let Err(e) = self.save() {
            self.wands.insert(key, at);
            return Err(e);
        }

        info!("Forgot known wand {}", key);
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        let file = KnownWandsFile {
            version: 1,
            wands: self.wands.clone(),
        };
        let content = serde_json::to_vec_pretty(&file)?;
        self.store
            .set(NAMESPACE, KEY, &content)
            .context("Failed to persist known wands")?;

        debug!("Saved {} known wand(s)", self.wands.len());
        Ok(())
    }
}

fn normalize(public_key: &str) -> String {
    public_key.trim().to_ascii_lowercase()
}
