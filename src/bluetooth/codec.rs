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

//! Key payload codec.
//!
//! A payload is encoded as a JSON object so a truncated or garbled source fails
//! to decode instead of yielding a half-filled payload.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// A signed identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPayload {
    #[serde(rename = "pubKey")]
    pub public_key: String,
    pub signature: String,
    pub message: String,
}

impl KeyPayload {
    pub fn new(
        public_key: impl Into<String>,
        signature: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            signature: signature.into(),
            message: message.into(),
        }
    }
}

/// Encode a payload.
pub fn encode(payload: &KeyPayload) -> Vec<u8> {
    // Serializing a struct of three strings cannot fail.
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Decode a payload. All three fields must be present.
pub fn decode(bytes: &[u8]) -> Result<KeyPayload, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}
