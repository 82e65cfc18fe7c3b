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

//! Types exchanged between the host BLE binding and the role state machines.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque, stable handle for a remote peripheral (the BlueZ address on Linux).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last reported state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterState {
    /// No report received yet.
    #[default]
    Unknown,
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl AdapterState {
    /// States in which no BLE operation can succeed until the adapter changes.
    pub fn is_unavailable(self) -> bool {
        matches!(
            self,
            AdapterState::PoweredOff | AdapterState::Unauthorized | AdapterState::Unsupported
        )
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterState::Unknown => "unknown",
            AdapterState::PoweredOn => "powered on",
            AdapterState::PoweredOff => "powered off",
            AdapterState::Unauthorized => "unauthorized",
            AdapterState::Unsupported => "not supported",
        };
        f.write_str(s)
    }
}

/// A peripheral seen during scanning.
///
/// Replaced as a whole on rediscovery of the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub id: PeripheralId,
    pub display_name: Option<String>,
    pub rssi: i16,
    /// Advertisement fields keyed by `service:<uuid>` or `manufacturer:<id>`.
    pub advertisement: BTreeMap<String, Vec<u8>>,
}

impl DiscoveredDevice {
    pub fn new(id: PeripheralId, display_name: Option<String>, rssi: i16) -> Self {
        Self {
            id,
            display_name,
            rssi,
            advertisement: BTreeMap::new(),
        }
    }
}

/// Sort devices strongest signal first. Equal RSSI falls back to id order so the
/// snapshot is stable between updates.
pub fn sort_by_signal(devices: &mut [DiscoveredDevice]) {
    devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.id.cmp(&b.id)));
}

/// Callbacks delivered by a central-role host binding.
///
/// Failures carry the platform error already rendered to a string; raw platform
/// error types never cross this boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    AdapterStateChanged(AdapterState),
    Discovered(DiscoveredDevice),
    Connected(PeripheralId),
    ConnectFailed {
        id: PeripheralId,
        reason: String,
    },
    Disconnected {
        id: PeripheralId,
        reason: Option<String>,
    },
    ServicesDiscovered {
        id: PeripheralId,
        services: Result<Vec<Uuid>, String>,
    },
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        characteristics: Result<Vec<Uuid>, String>,
    },
    /// A read completed or a notification arrived.
    ValueUpdated {
        id: PeripheralId,
        characteristic: Uuid,
        value: Result<Vec<u8>, String>,
    },
    WriteCompleted {
        id: PeripheralId,
        characteristic: Uuid,
        result: Result<(), String>,
    },
}

/// Callbacks delivered by a peripheral-role host binding.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    AdapterStateChanged(AdapterState),
    /// The service was registered and advertising began (or failed to).
    AdvertisingStarted(Result<(), String>),
}
