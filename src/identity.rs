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

//! Local identity and the signing capability.

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::storage::KeyValueStore;

const NAMESPACE: &str = "identity";
const PRIMARY_UUID_KEY: &str = "primaryUUID";

/// Identity of this installation at the trust service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub primary_uuid: Uuid,
}

impl LocalIdentity {
    /// Load the stored identity, creating and persisting one on first run.
    pub fn load_or_create(store: &dyn KeyValueStore) -> Result<Self> {
        if let Some(bytes) = store.get(NAMESPACE, PRIMARY_UUID_KEY)? {
            let text = String::from_utf8(bytes).context("Stored primary UUID is not UTF-8")?;
            let primary_uuid = Uuid::parse_str(text.trim())
                .with_context(|| format!("Stored primary UUID {:?} is invalid", text))?;
            return Ok(Self { primary_uuid });
        }

        let primary_uuid = Uuid::new_v4();
        store.set(
            NAMESPACE,
            PRIMARY_UUID_KEY,
            primary_uuid.to_string().as_bytes(),
        )?;
        info!("Created local identity {}", primary_uuid);
        Ok(Self { primary_uuid })
    }
}

/// Opaque signing primitive. The key material never leaves the implementation.
pub trait Signer: Send + Sync {
    /// Sign `message`, or `None` when no key is available.
    fn sign(&self, message: &str) -> Option<String>;
}

/// Signer used when no signing key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigner;

impl Signer for NoSigner {
    fn sign(&self, _message: &str) -> Option<String> {
        None
    }
}
