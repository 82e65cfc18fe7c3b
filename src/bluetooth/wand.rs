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

//! Wand discovery and auto-connect.
//!
//! Scanning starts as soon as the adapter is powered on and never stops on its
//! own. Every peripheral whose advertised name carries the wand prefix is
//! connected to, its identity characteristic read and its command
//! characteristic subscribed. Unexpected disconnects schedule a reconnect
//! through [`ReconnectTimer`]; a ticket that no longer matches the armed
//! generation is dropped when it fires.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::{self, *};
use super::command::{self, CommandEnvelope, WandCommand};
use super::host::{CentralHost, ReconnectTicket, ReconnectTimer};
use super::types::{AdapterState, CentralEvent, DiscoveredDevice, PeripheralId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WandConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// A wand seen by this installation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WandRecord {
    pub id: PeripheralId,
    pub name: String,
    /// Hex-encoded identity key; empty until read.
    pub public_key: String,
    pub rssi: i16,
    pub connection_state: WandConnectionState,
    pub last_seen: DateTime<Utc>,
}

/// Handle to a record that stays valid while the record is updated in place.
pub type SharedWand = Arc<RwLock<WandRecord>>;

/// Notifications for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum WandEvent {
    Connected(WandRecord),
    PublicKeyReceived {
        wand: WandRecord,
        public_key: String,
    },
    Disconnected(WandRecord),
    SpellCast {
        wand: WandRecord,
        spell: String,
    },
}

#[derive(Debug, Clone)]
pub struct WandSettings {
    pub name_prefix: String,
    pub reconnect_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for WandSettings {
    fn default() -> Self {
        Self {
            name_prefix: ble_constants::wand::NAME_PREFIX.to_string(),
            reconnect_delay: ble_constants::wand::RECONNECT_DELAY,
            max_reconnect_attempts: None,
        }
    }
}

/// Characteristics discovered on the current connection.
#[derive(Debug, Default)]
struct Link {
    identity: bool,
    command: bool,
}

/// Wand discovery and auto-connect state machine.
pub struct WandDiscovery {
    host: Box<dyn CentralHost>,
    timer: Box<dyn ReconnectTimer>,
    events: mpsc::UnboundedSender<WandEvent>,
    settings: WandSettings,
    adapter: AdapterState,
    scanning: bool,
    wands: HashMap<PeripheralId, SharedWand>,
    links: HashMap<PeripheralId, Link>,
    armed: HashMap<PeripheralId, u64>,
    next_generation: u64,
    attempts: HashMap<PeripheralId, u32>,
    manual_disconnects: HashSet<PeripheralId>,
}

impl WandDiscovery {
    pub fn new(
        host: Box<dyn CentralHost>,
        timer: Box<dyn ReconnectTimer>,
        events: mpsc::UnboundedSender<WandEvent>,
        settings: WandSettings,
    ) -> Self {
        Self {
            host,
            timer,
            events,
            settings,
            adapter: AdapterState::Unknown,
            scanning: false,
            wands: HashMap::new(),
            links: HashMap::new(),
            armed: HashMap::new(),
            next_generation: 0,
            attempts: HashMap::new(),
            manual_disconnects: HashSet::new(),
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Snapshots of all known wands, strongest signal first.
    pub fn wands(&self) -> Vec<WandRecord> {
        let mut list: Vec<WandRecord> = self.wands.values().map(|w| w.read().clone()).collect();
        list.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn wand(&self, id: &PeripheralId) -> Option<SharedWand> {
        self.wands.get(id).cloned()
    }

    pub fn find_by_public_key(&self, public_key: &str) -> Option<PeripheralId> {
        self.wands
            .iter()
            .find(|(_, w)| w.read().public_key.eq_ignore_ascii_case(public_key))
            .map(|(id, _)| id.clone())
    }

    /// Drop a wand from the table. The BLE connection is left alone, but a
    /// later disconnect no longer schedules a reconnect.
    pub fn forget(&mut self, id: &PeripheralId) -> bool {
        let removed = self.wands.remove(id).is_some();
        self.links.remove(id);
        self.attempts.remove(id);
        self.manual_disconnects.remove(id);
        self.cancel_reconnect(id);
        if removed {
            info!("Forgot wand {}", id);
        }
        removed
    }

    pub fn forget_public_key(&mut self, public_key: &str) -> bool {
        match self.find_by_public_key(public_key) {
            Some(id) => self.forget(&id),
            None => false,
        }
    }

    /// Disconnect a wand on request; no reconnect follows this disconnect.
    pub fn disconnect_wand(&mut self, id: &PeripheralId) {
        if !self.wands.contains_key(id) {
            debug!("disconnect_wand: {} is not known", id);
            return;
        }
        self.cancel_reconnect(id);
        self.manual_disconnects.insert(id.clone());
        self.host.disconnect(id);
    }

    /// Write `envelope` to the wand's command characteristic.
    ///
    /// Returns `false` (and only logs) when the wand is not connected or its
    /// command characteristic was never discovered.
    pub fn send_command(&mut self, id: &PeripheralId, envelope: &CommandEnvelope) -> bool {
        let connected = self
            .wands
            .get(id)
            .map(|w| w.read().connection_state == WandConnectionState::Connected)
            .unwrap_or(false);
        let has_command = self.links.get(id).map(|l| l.command).unwrap_or(false);

        if !connected || !has_command {
            warn!(
                "Not sending '{}' to {}: wand not connected",
                envelope.action, id
            );
            return false;
        }

        debug!("Sending '{}' to {}", envelope.action, id);
        self.host.write(id, WAND_COMMAND_UUID, envelope.to_json());
        true
    }

    /// Stop scanning and cancel every pending reconnect.
    pub fn shutdown(&mut self) {
        if self.scanning {
            self.host.stop_scan();
            self.scanning = false;
        }
        self.timer.disarm_all();
        self.armed.clear();
    }

    /// A reconnect timer fired.
    pub fn on_reconnect_due(&mut self, ticket: ReconnectTicket) {
        if self.armed.get(&ticket.id) != Some(&ticket.generation) {
            debug!("Dropping stale reconnect for {}", ticket.id);
            return;
        }
        self.armed.remove(&ticket.id);

        let Some(wand) = self.wands.get(&ticket.id) else {
            return;
        };
        if wand.read().connection_state != WandConnectionState::Disconnected {
            return;
        }
        if self.adapter != AdapterState::PoweredOn {
            debug!("Adapter off, skipping reconnect to {}", ticket.id);
            return;
        }

        info!("Reconnecting to wand {}", ticket.id);
        wand.write().connection_state = WandConnectionState::Connecting;
        self.host.connect(&ticket.id);
    }

    pub fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            CentralEvent::Discovered(device) => self.on_discovered(device),
            CentralEvent::Connected(id) => {
                if self.wands.contains_key(&id) {
                    debug!("Wand {} connected, discovering service", id);
                    self.host.discover_services(&id, &[WAND_SERVICE_UUID]);
                } else {
                    debug!("Connected to untracked peripheral {}", id);
                }
            }
            CentralEvent::ConnectFailed { id, reason } => {
                warn!("Connecting to wand {} failed: {}", id, reason);
                self.on_link_lost(id, false);
            }
            CentralEvent::Disconnected { id, reason } => {
                if let Some(reason) = reason {
                    debug!("Wand {} disconnect reason: {}", id, reason);
                }
                self.on_link_lost(id, true);
            }
            CentralEvent::ServicesDiscovered { id, services } => self.on_services(id, services),
            CentralEvent::CharacteristicsDiscovered {
                id,
                characteristics,
                ..
            } => self.on_characteristics(id, characteristics),
            CentralEvent::ValueUpdated {
                id,
                characteristic,
                value,
            } => match value {
                Ok(value) => self.on_value(id, characteristic, value),
                Err(reason) => self.on_value_error(id, characteristic, reason),
            },
            CentralEvent::WriteCompleted { id, result, .. } => match result {
                Ok(()) => debug!("Command delivered to {}", id),
                Err(reason) => warn!("Command write to {} failed: {}", id, reason),
            },
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        debug!("Wand adapter state: {}", state);
        self.adapter = state;

        if state == AdapterState::PoweredOn {
            if !self.scanning {
                info!("Scanning for wands");
                self.host.start_scan(&[]);
                self.scanning = true;
            }
        } else if state.is_unavailable() {
            warn!("Adapter {}, pausing wand discovery", state);
            self.scanning = false;
            self.timer.disarm_all();
            self.armed.clear();
            self.links.clear();
            for wand in self.wands.values() {
                wand.write().connection_state = WandConnectionState::Disconnected;
            }
        }
    }

    fn on_discovered(&mut self, device: DiscoveredDevice) {
        let name = match device.display_name.as_deref() {
            Some(name) if name.starts_with(&self.settings.name_prefix) => name.to_string(),
            _ => return,
        };

        let now = Utc::now();
        let wand = self
            .wands
            .entry(device.id.clone())
            .or_insert_with(|| {
                info!("Discovered wand {} ({})", name, device.id);
                Arc::new(RwLock::new(WandRecord {
                    id: device.id.clone(),
                    name: name.clone(),
                    public_key: String::new(),
                    rssi: device.rssi,
                    connection_state: WandConnectionState::Discovered,
                    last_seen: now,
                }))
            })
            .clone();

        {
            let mut record = wand.write();
            record.name = name;
            record.rssi = device.rssi;
            record.last_seen = now;
            if matches!(
                record.connection_state,
                WandConnectionState::Discovered | WandConnectionState::Disconnected
            ) {
                record.connection_state = WandConnectionState::Connecting;
            }
        }

        self.cancel_reconnect(&device.id);
        self.host.connect(&device.id);
    }

    fn on_link_lost(&mut self, id: PeripheralId, was_connected: bool) {
        self.links.remove(&id);
        let manual = self.manual_disconnects.remove(&id);

        let Some(wand) = self.wands.get(&id).cloned() else {
            debug!("Untracked peripheral {} went away", id);
            return;
        };
        let snapshot = {
            let mut record = wand.write();
            record.connection_state = WandConnectionState::Disconnected;
            record.clone()
        };
        if was_connected {
            info!("Wand {} disconnected", id);
            self.emit(WandEvent::Disconnected(snapshot));
        }

        if manual {
            debug!("Wand {} disconnected on request, not reconnecting", id);
            return;
        }
        self.schedule_reconnect(id);
    }

    fn on_services(&mut self, id: PeripheralId, services: Result<Vec<Uuid>, String>) {
        if !self.wands.contains_key(&id) {
            return;
        }
        match services {
            Ok(services) if services.contains(&WAND_SERVICE_UUID) => {
                self.host.discover_characteristics(
                    &id,
                    WAND_SERVICE_UUID,
                    &[WAND_IDENTITY_UUID, WAND_COMMAND_UUID],
                );
            }
            Ok(_) => {
                warn!("{} does not offer the wand service", id);
                self.host.disconnect(&id);
            }
            Err(reason) => {
                warn!("Wand service discovery on {} failed: {}", id, reason);
                self.host.disconnect(&id);
            }
        }
    }

    fn on_characteristics(&mut self, id: PeripheralId, found: Result<Vec<Uuid>, String>) {
        if !self.wands.contains_key(&id) {
            return;
        }
        let found = match found {
            Ok(found) => found,
            Err(reason) => {
                warn!("Wand characteristic discovery on {} failed: {}", id, reason);
                self.host.disconnect(&id);
                return;
            }
        };

        let link = Link {
            identity: found.contains(&WAND_IDENTITY_UUID),
            command: found.contains(&WAND_COMMAND_UUID),
        };
        // Without the identity the wand can never leave Connecting.
        if !link.identity {
            warn!("{} exposes no wand identity characteristic", id);
            self.host.disconnect(&id);
            return;
        }

        self.host.read(&id, WAND_IDENTITY_UUID);
        if link.command {
            self.host.subscribe(&id, WAND_COMMAND_UUID);
        }
        self.links.insert(id, link);
    }

    fn on_value(&mut self, id: PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        let Some(wand) = self.wands.get(&id).cloned() else {
            debug!("Dropping value from untracked peripheral {}", id);
            return;
        };

        match characteristic {
            WAND_IDENTITY_UUID => self.on_identity(&id, &wand, &value),
            WAND_COMMAND_UUID => {
                if let Some(WandCommand::Cast { spell }) = command::parse(&value) {
                    info!("Wand {} cast '{}'", id, spell);
                    let snapshot = wand.read().clone();
                    self.emit(WandEvent::SpellCast {
                        wand: snapshot,
                        spell,
                    });
                }
            }
            other => debug!("Ignoring value for {} from {}", other, id),
        }
    }

    fn on_value_error(&mut self, id: PeripheralId, characteristic: Uuid, reason: String) {
        warn!("Wand {} value error on {}: {}", id, characteristic, reason);
        if characteristic == WAND_IDENTITY_UUID && self.wands.contains_key(&id) {
            // Tear down so the reconnect path retries the read.
            self.host.disconnect(&id);
        }
    }

    fn on_identity(&mut self, id: &PeripheralId, wand: &SharedWand, value: &[u8]) {
        if value.len() != ble_constants::wand::PUBLIC_KEY_LEN {
            debug!(
                "Ignoring {}-byte identity value from {} (expected {})",
                value.len(),
                id,
                ble_constants::wand::PUBLIC_KEY_LEN
            );
            return;
        }

        let public_key = hex::encode(value);
        let (changed, snapshot) = {
            let mut record = wand.write();
            let changed = record.connection_state != WandConnectionState::Connected
                || record.public_key != public_key;
            record.public_key = public_key.clone();
            record.connection_state = WandConnectionState::Connected;
            record.last_seen = Utc::now();
            (changed, record.clone())
        };
        self.attempts.remove(id);

        if changed {
            info!("Wand {} connected with key {}", id, public_key);
            self.emit(WandEvent::Connected(snapshot.clone()));
            self.emit(WandEvent::PublicKeyReceived {
                wand: snapshot,
                public_key,
            });
        }
    }

    fn schedule_reconnect(&mut self, id: PeripheralId) {
        let attempts = self.attempts.entry(id.clone()).or_insert(0);
        *attempts += 1;
        if let Some(max) = self.settings.max_reconnect_attempts {
            if *attempts > max {
                warn!("Giving up on reconnecting to {} after {} attempts", id, max);
                return;
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert(id.clone(), generation);
        debug!(
            "Reconnect to {} in {:?} (attempt {})",
            id, self.settings.reconnect_delay, attempts
        );
        self.timer
            .arm(ReconnectTicket { id, generation }, self.settings.reconnect_delay);
    }

    fn cancel_reconnect(&mut self, id: &PeripheralId) {
        if self.armed.remove(id).is_some() {
            self.timer.disarm(id);
        }
    }

    fn emit(&self, event: WandEvent) {
        if self.events.send(event).is_err() {
            debug!("Wand event receiver dropped");
        }
    }
}
