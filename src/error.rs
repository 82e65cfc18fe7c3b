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

//! Error taxonomy surfaced to callers.
//!
//! Noise conditions (wrong-length identity values, unknown command actions,
//! non-matching device names) are not represented here: they are dropped where
//! they are detected.

use thiserror::Error;

use crate::bluetooth::AdapterState;

/// Failure of an explicit BLE operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BleError {
    #[error("Bluetooth is unavailable ({0})")]
    AdapterUnavailable(AdapterState),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Another key exchange is already in progress")]
    Busy,

    #[error("The operation was cancelled")]
    Cancelled,
}

impl BleError {
    pub fn is_adapter_unavailable(&self) -> bool {
        matches!(self, BleError::AdapterUnavailable(_))
    }
}

impl From<DecodeError> for BleError {
    fn from(e: DecodeError) -> Self {
        BleError::Protocol(ProtocolError::Decode(e))
    }
}

/// Failure of a single connection attempt. The connection is torn down.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Could not connect to the device: {0}")]
    ConnectFailed(String),

    #[error("The device does not offer the key exchange service")]
    ServiceNotFound,

    #[error("The device is missing the {0} characteristic")]
    CharacteristicNotFound(&'static str),

    #[error("Reading from the device failed: {0}")]
    ReadFailed(String),

    #[error("Writing to the device failed: {0}")]
    WriteFailed(String),

    #[error("Advertising could not be started: {0}")]
    AdvertiseFailed(String),

    #[error("The device disconnected before the key was received")]
    UnexpectedDisconnect,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A payload that could not be decoded. Treated as "no usable payload".
#[derive(Debug, Clone, PartialEq, Error)]
#[error("The received key payload is not readable: {0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for DecodeError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        DecodeError(e.to_string())
    }
}

/// Outcome of a failed wand registration. Never marks the wand as known.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistrationError {
    #[error("{message}")]
    Rejected { message: String },

    #[error("The trust service could not be reached: {0}")]
    Unreachable(String),

    #[error("A registration for this wand is already in progress")]
    AlreadyInFlight,

    #[error("The registration could not be saved: {0}")]
    Storage(String),
}

/// Fallback message when the trust service gives none.
pub const REGISTRATION_FAILED: &str = "Wand registration failed";
