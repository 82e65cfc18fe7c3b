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

//! Recording host doubles for state machine tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::advertiser::PayloadSlot;
use super::host::{CentralHost, PeripheralHost, ReconnectTicket, ReconnectTimer};
use super::types::PeripheralId;

#[derive(Debug, Clone, PartialEq)]
pub enum CentralCall {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid),
    Read(PeripheralId, Uuid),
    Subscribe(PeripheralId, Uuid),
    Write(PeripheralId, Uuid, Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct MockCentral {
    calls: Arc<Mutex<Vec<CentralCall>>>,
}

impl MockCentral {
    pub fn calls(&self) -> Vec<CentralCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&CentralCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn push(&self, call: CentralCall) {
        self.calls.lock().push(call);
    }
}

impl CentralHost for MockCentral {
    fn start_scan(&mut self, services: &[Uuid]) {
        self.push(CentralCall::StartScan(services.to_vec()));
    }

    fn stop_scan(&mut self) {
        self.push(CentralCall::StopScan);
    }

    fn connect(&mut self, id: &PeripheralId) {
        self.push(CentralCall::Connect(id.clone()));
    }

    fn disconnect(&mut self, id: &PeripheralId) {
        self.push(CentralCall::Disconnect(id.clone()));
    }

    fn discover_services(&mut self, id: &PeripheralId, _services: &[Uuid]) {
        self.push(CentralCall::DiscoverServices(id.clone()));
    }

    fn discover_characteristics(
        &mut self,
        id: &PeripheralId,
        service: Uuid,
        _characteristics: &[Uuid],
    ) {
        self.push(CentralCall::DiscoverCharacteristics(id.clone(), service));
    }

    fn read(&mut self, id: &PeripheralId, characteristic: Uuid) {
        self.push(CentralCall::Read(id.clone(), characteristic));
    }

    fn subscribe(&mut self, id: &PeripheralId, characteristic: Uuid) {
        self.push(CentralCall::Subscribe(id.clone(), characteristic));
    }

    fn write(&mut self, id: &PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        self.push(CentralCall::Write(id.clone(), characteristic, value));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    StartAdvertising,
    StopAdvertising,
}

#[derive(Debug, Clone, Default)]
pub struct MockPeripheral {
    calls: Arc<Mutex<Vec<PeripheralCall>>>,
}

impl MockPeripheral {
    pub fn calls(&self) -> Vec<PeripheralCall> {
        self.calls.lock().clone()
    }
}

impl PeripheralHost for MockPeripheral {
    fn start_advertising(&mut self, _slot: PayloadSlot) {
        self.calls.lock().push(PeripheralCall::StartAdvertising);
    }

    fn stop_advertising(&mut self) {
        self.calls.lock().push(PeripheralCall::StopAdvertising);
    }
}

#[derive(Debug, Default)]
struct TimerState {
    armed: Vec<(ReconnectTicket, Duration)>,
    disarmed: Vec<PeripheralId>,
}

/// Records armed tickets; tests fire them by hand.
#[derive(Debug, Clone, Default)]
pub struct MockTimer {
    state: Arc<Mutex<TimerState>>,
}

impl MockTimer {
    pub fn armed(&self) -> Vec<ReconnectTicket> {
        self.state.lock().armed.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.state.lock().armed.last().map(|(_, d)| *d)
    }

    pub fn disarmed(&self) -> Vec<PeripheralId> {
        self.state.lock().disarmed.clone()
    }
}

impl ReconnectTimer for MockTimer {
    fn arm(&mut self, ticket: ReconnectTicket, delay: Duration) {
        self.state.lock().armed.push((ticket, delay));
    }

    fn disarm(&mut self, id: &PeripheralId) {
        self.state.lock().disarmed.push(id.clone());
    }

    fn disarm_all(&mut self) {
        let mut state = self.state.lock();
        let ids: Vec<PeripheralId> = state.armed.iter().map(|(t, _)| t.id.clone()).collect();
        state.disarmed.extend(ids);
    }
}
