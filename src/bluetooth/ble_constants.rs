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

//! BLE service layout shared by both roles.

use std::time::Duration;
use uuid::Uuid;

/// Key exchange service.
pub const KEY_SERVICE_UUID: Uuid = Uuid::from_u128(0x9e1c0000_5a4e_4e39_9b1a_706c616e6574);

/// Public key characteristic (read + write).
pub const PUBLIC_KEY_UUID: Uuid = Uuid::from_u128(0x9e1c0001_5a4e_4e39_9b1a_706c616e6574);

/// Signature characteristic (read + write).
pub const SIGNATURE_UUID: Uuid = Uuid::from_u128(0x9e1c0002_5a4e_4e39_9b1a_706c616e6574);

/// Message characteristic (read only).
pub const MESSAGE_UUID: Uuid = Uuid::from_u128(0x9e1c0003_5a4e_4e39_9b1a_706c616e6574);

/// Wand service.
pub const WAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x9e1c1000_5a4e_4e39_9b1a_706c616e6574);

/// Wand identity characteristic (read + notify), carries the raw public key.
pub const WAND_IDENTITY_UUID: Uuid = Uuid::from_u128(0x9e1c1001_5a4e_4e39_9b1a_706c616e6574);

/// Wand command characteristic (write + notify), carries JSON envelopes.
pub const WAND_COMMAND_UUID: Uuid = Uuid::from_u128(0x9e1c1002_5a4e_4e39_9b1a_706c616e6574);

/// Wand configuration defaults.
pub mod wand {
    use super::Duration;

    /// Advertised names of wands start with this.
    pub const NAME_PREFIX: &str = "P9-Wand";

    /// Compressed secp256k1 public key.
    pub const PUBLIC_KEY_LEN: usize = 33;

    /// Delay before reconnecting after an unexpected disconnect.
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
}
