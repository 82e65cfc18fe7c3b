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

//! Capabilities a host BLE binding provides to the role state machines.
//!
//! Every method only *issues* an operation and returns immediately. Outcomes come
//! back later as [`CentralEvent`](super::CentralEvent) or
//! [`PeripheralEvent`](super::PeripheralEvent) values on the engine's event
//! channels, so the state machines are only ever mutated from the engine task.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::advertiser::PayloadSlot;
use super::types::PeripheralId;

/// Central (scanner) role operations.
pub trait CentralHost: Send {
    /// Start scanning. An empty `services` list scans for everything.
    fn start_scan(&mut self, services: &[Uuid]);
    fn stop_scan(&mut self);
    /// Connecting to an already connecting peripheral is a no-op. An already
    /// connected one reports `Connected` again.
    fn connect(&mut self, id: &PeripheralId);
    fn disconnect(&mut self, id: &PeripheralId);
    fn discover_services(&mut self, id: &PeripheralId, services: &[Uuid]);
    fn discover_characteristics(
        &mut self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    );
    fn read(&mut self, id: &PeripheralId, characteristic: Uuid);
    fn subscribe(&mut self, id: &PeripheralId, characteristic: Uuid);
    /// Write with response.
    fn write(&mut self, id: &PeripheralId, characteristic: Uuid, value: Vec<u8>);
}

/// Central binding for a role that should stay dormant. It never reports
/// an adapter state, so nothing driven by it starts scanning.
#[derive(Debug, Default)]
pub struct IdleCentral;

impl CentralHost for IdleCentral {
    fn start_scan(&mut self, _services: &[Uuid]) {}
    fn stop_scan(&mut self) {}
    fn connect(&mut self, _id: &PeripheralId) {}
    fn disconnect(&mut self, _id: &PeripheralId) {}
    fn discover_services(&mut self, _id: &PeripheralId, _services: &[Uuid]) {}
    fn discover_characteristics(
        &mut self,
        _id: &PeripheralId,
        _service: Uuid,
        _characteristics: &[Uuid],
    ) {
    }
    fn read(&mut self, _id: &PeripheralId, _characteristic: Uuid) {}
    fn subscribe(&mut self, _id: &PeripheralId, _characteristic: Uuid) {}
    fn write(&mut self, _id: &PeripheralId, _characteristic: Uuid, _value: Vec<u8>) {}
}

/// Peripheral (advertiser) role operations.
pub trait PeripheralHost: Send {
    /// Publish the key exchange service and start advertising. Inbound reads and
    /// writes are answered synchronously from `slot`.
    fn start_advertising(&mut self, slot: PayloadSlot);
    fn stop_advertising(&mut self);
}

/// A pending reconnect for one wand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTicket {
    pub id: PeripheralId,
    pub generation: u64,
}

/// At most one armed timer per peripheral.
pub trait ReconnectTimer: Send {
    /// Arm (or re-arm) the timer for `ticket.id`. When it fires the ticket is
    /// handed back to the wand state machine.
    fn arm(&mut self, ticket: ReconnectTicket, delay: Duration);
    fn disarm(&mut self, id: &PeripheralId);
    fn disarm_all(&mut self);
}

/// Reconnect timer backed by `tokio::time::sleep` tasks.
pub struct TokioReconnectTimer {
    fired_tx: mpsc::UnboundedSender<ReconnectTicket>,
    timers: HashMap<PeripheralId, JoinHandle<()>>,
}

impl TokioReconnectTimer {
    pub fn new(fired_tx: mpsc::UnboundedSender<ReconnectTicket>) -> Self {
        Self {
            fired_tx,
            timers: HashMap::new(),
        }
    }
}

impl ReconnectTimer for TokioReconnectTimer {
    fn arm(&mut self, ticket: ReconnectTicket, delay: Duration) {
        self.disarm(&ticket.id);
        debug!(
            "Arming reconnect timer for {} (gen {}) in {:?}",
            ticket.id, ticket.generation, delay
        );

        let id = ticket.id.clone();
        let fired_tx = self.fired_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired_tx.send(ticket);
        });
        self.timers.insert(id, handle);
    }

    fn disarm(&mut self, id: &PeripheralId) {
        if let Some(handle) = self.timers.remove(id) {
            handle.abort();
        }
    }

    fn disarm_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for TokioReconnectTimer {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
