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

//! Wand command channel envelopes.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Envelope carried over the command characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spell: Option<String>,
}

impl CommandEnvelope {
    pub fn new(action: impl Into<String>, spell: Option<String>) -> Self {
        Self {
            action: action.into(),
            spell,
        }
    }

    pub fn cast(spell: impl Into<String>) -> Self {
        Self::new(action::CAST, Some(spell.into()))
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Action names.
pub mod action {
    pub const CAST: &str = "cast";
    /// Sent back to a wand once a spell has been handled.
    pub const CAST_RESULT: &str = "castResult";
}

/// Recognized, supported commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WandCommand {
    Cast { spell: String },
}

/// Parse a notification from the command characteristic.
///
/// Malformed JSON, unknown actions and a `cast` without a spell all yield `None`.
pub fn parse(bytes: &[u8]) -> Option<WandCommand> {
    let envelope = match CommandEnvelope::from_json(bytes) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Ignoring malformed command ({} bytes): {}", bytes.len(), e);
            return None;
        }
    };

    match envelope.action.as_str() {
        action::CAST => match envelope.spell {
            Some(spell) if !spell.is_empty() => Some(WandCommand::Cast { spell }),
            _ => {
                debug!("Ignoring cast without a spell");
                None
            }
        },
        other => {
            debug!("Ignoring unsupported action '{}'", other);
            None
        }
    }
}
