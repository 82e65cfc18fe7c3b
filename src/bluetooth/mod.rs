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

//! Bluetooth LE roles: key exchange (advertiser and scanner) and wands.

pub mod advertiser;
pub mod ble_constants;
pub mod bluez;
pub mod codec;
pub mod command;
pub mod gatt_server;
pub mod host;
pub mod scanner;
pub mod types;
pub mod wand;

#[cfg(test)]
pub(crate) mod testing;

pub use advertiser::{Advertiser, AdvertiserState, PayloadSlot};
pub use codec::KeyPayload;
pub use host::{
    CentralHost, IdleCentral, PeripheralHost, ReconnectTicket, ReconnectTimer,
    TokioReconnectTimer,
};
pub use scanner::{KeyScanner, ScannerState};
pub use types::{AdapterState, CentralEvent, DiscoveredDevice, PeripheralEvent, PeripheralId};
pub use wand::{
    SharedWand, WandConnectionState, WandDiscovery, WandEvent, WandRecord, WandSettings,
};
