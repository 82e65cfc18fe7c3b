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

//! Wand event processing and spell dispatch.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bluetooth::command::{action, CommandEnvelope};
use crate::bluetooth::{PeripheralId, WandEvent, WandRecord};
use crate::coordinator::WandCoordinator;
use crate::error::RegistrationError;

/// Application-level handler for spells cast with a wand.
pub trait SpellHandler: Send {
    /// Handle `spell`. A returned envelope is written back to the wand.
    fn cast(&mut self, spell: &str, wand: &WandRecord) -> Option<CommandEnvelope>;
}

/// Logs every spell and confirms it to the wand.
#[derive(Debug, Default)]
pub struct LoggingSpellHandler;

impl SpellHandler for LoggingSpellHandler {
    fn cast(&mut self, spell: &str, wand: &WandRecord) -> Option<CommandEnvelope> {
        info!("🪄 {} cast '{}'", wand.name, spell);
        Some(CommandEnvelope::new(
            action::CAST_RESULT,
            Some(spell.to_string()),
        ))
    }
}

/// Process events from wand discovery.
pub struct EventProcessor {
    coordinator: Arc<WandCoordinator>,
    spells: Box<dyn SpellHandler>,
}

impl EventProcessor {
    pub fn new(coordinator: Arc<WandCoordinator>, spells: Box<dyn SpellHandler>) -> Self {
        Self {
            coordinator,
            spells,
        }
    }

    /// Process a single event. Returns a command to send back, if any.
    pub fn process_event(&mut self, event: WandEvent) -> Option<(PeripheralId, CommandEnvelope)> {
        match event {
            WandEvent::Connected(wand) => {
                info!("Wand connected: {} ({})", wand.name, wand.id);
                None
            }
            WandEvent::PublicKeyReceived { wand, public_key } => {
                self.register(public_key, wand.name);
                None
            }
            WandEvent::Disconnected(wand) => {
                info!("Wand disconnected: {} ({})", wand.name, wand.id);
                None
            }
            WandEvent::SpellCast { wand, spell } => self
                .spells
                .cast(&spell, &wand)
                .map(|reply| (wand.id, reply)),
        }
    }

    /// Register in the background. Outcomes are only logged: this is never a
    /// user-initiated action.
    fn register(&self, public_key: String, name: String) -> JoinHandle<()> {
        let coordinator = self.coordinator.clone();
        tokio::spawn(async move {
            match coordinator.register_wand(&public_key, &name).await {
                Ok(outcome) => info!("Wand {}: {}", name, outcome.message()),
                Err(RegistrationError::AlreadyInFlight) => {
                    debug!("Registration of {} already running", name)
                }
                Err(e) => warn!("Auto-registration of {} failed: {}", name, e),
            }
        })
    }
}
