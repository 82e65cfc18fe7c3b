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

//! Advertiser role: shares the local key payload with a nearby scanner.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::*;
use super::codec::KeyPayload;
use super::host::PeripheralHost;
use super::types::{AdapterState, PeripheralEvent};
use crate::error::{BleError, ProtocolError};

/// Completion of a `start_advertising` call.
pub type AdvertiseReply = oneshot::Sender<Result<(), BleError>>;

/// Why an inbound attribute request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeError {
    /// The characteristic is not part of the key exchange service.
    NotFound,
    /// No payload is stored, or the written value is not UTF-8.
    InvalidValue,
    /// Write to a read-only characteristic.
    NotPermitted,
}

/// The payload being advertised, shared with the host binding so read requests
/// can be answered without a round trip through the engine.
#[derive(Debug, Clone, Default)]
pub struct PayloadSlot(Arc<RwLock<Option<KeyPayload>>>);

impl PayloadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, payload: KeyPayload) {
        *self.0.write() = Some(payload);
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }

    pub fn get(&self) -> Option<KeyPayload> {
        self.0.read().clone()
    }

    /// Answer a read request for `characteristic` with that field's UTF-8 bytes.
    pub fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, AttributeError> {
        let guard = self.0.read();
        let payload = guard.as_ref();
        let field = match characteristic {
            PUBLIC_KEY_UUID => payload.map(|p| p.public_key.as_str()),
            SIGNATURE_UUID => payload.map(|p| p.signature.as_str()),
            MESSAGE_UUID => payload.map(|p| p.message.as_str()),
            _ => return Err(AttributeError::NotFound),
        };
        match field {
            Some(value) if !value.is_empty() => Ok(value.as_bytes().to_vec()),
            _ => Err(AttributeError::InvalidValue),
        }
    }

    /// Apply a write request. Public key and signature are writable.
    pub fn write(&self, characteristic: Uuid, value: &[u8]) -> Result<(), AttributeError> {
        if characteristic == MESSAGE_UUID {
            return Err(AttributeError::NotPermitted);
        }
        if characteristic != PUBLIC_KEY_UUID && characteristic != SIGNATURE_UUID {
            return Err(AttributeError::NotFound);
        }

        let text = std::str::from_utf8(value).map_err(|_| AttributeError::InvalidValue)?;
        let mut guard = self.0.write();
        let payload = guard.as_mut().ok_or(AttributeError::InvalidValue)?;
        if characteristic == PUBLIC_KEY_UUID {
            payload.public_key = text.to_string();
        } else {
            payload.signature = text.to_string();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiserState {
    Idle,
    AwaitingAdapterReady,
    /// Service registration and advertising were requested from the host.
    Publishing,
    Advertising,
}

/// Advertiser state machine.
pub struct Advertiser {
    host: Box<dyn PeripheralHost>,
    adapter: AdapterState,
    state: AdvertiserState,
    slot: PayloadSlot,
    pending: Option<AdvertiseReply>,
}

impl Advertiser {
    pub fn new(host: Box<dyn PeripheralHost>) -> Self {
        Self {
            host,
            adapter: AdapterState::Unknown,
            state: AdvertiserState::Idle,
            slot: PayloadSlot::new(),
            pending: None,
        }
    }

    pub fn state(&self) -> AdvertiserState {
        self.state
    }

    pub fn slot(&self) -> &PayloadSlot {
        &self.slot
    }

    /// Begin advertising `payload`, replacing any current session.
    pub fn start_advertising(&mut self, payload: KeyPayload, reply: AdvertiseReply) {
        if self.state != AdvertiserState::Idle {
            info!("Replacing existing advertisement session");
            self.teardown(BleError::Cancelled);
        }

        if self.adapter.is_unavailable() {
            error!("Cannot advertise: adapter {}", self.adapter);
            let _ = reply.send(Err(BleError::AdapterUnavailable(self.adapter)));
            return;
        }

        self.slot.set(payload);
        self.pending = Some(reply);

        if self.adapter == AdapterState::PoweredOn {
            self.publish();
        } else {
            info!("Adapter not ready, deferring advertisement");
            self.state = AdvertiserState::AwaitingAdapterReady;
        }
    }

    /// Stop advertising. Safe to call in any state.
    pub fn stop_advertising(&mut self) {
        if self.state == AdvertiserState::Idle {
            debug!("stop_advertising: already idle");
            return;
        }
        info!("Stopping advertisement");
        self.teardown(BleError::Cancelled);
    }

    pub fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            PeripheralEvent::AdvertisingStarted(result) => self.on_advertising_started(result),
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        debug!("Peripheral adapter state: {}", state);
        self.adapter = state;

        match state {
            AdapterState::PoweredOn => {
                if self.state == AdvertiserState::AwaitingAdapterReady {
                    self.publish();
                }
            }
            s if s.is_unavailable() => {
                if self.state != AdvertiserState::Idle {
                    warn!("Adapter became {} while advertising", s);
                    self.teardown(BleError::AdapterUnavailable(s));
                }
            }
            _ => {}
        }
    }

    fn on_advertising_started(&mut self, result: Result<(), String>) {
        if self.state != AdvertiserState::Publishing {
            debug!("Ignoring advertising result outside of a publish");
            return;
        }

        match result {
            Ok(()) => {
                info!("Advertising key exchange service");
                self.state = AdvertiserState::Advertising;
                if let Some(reply) = self.pending.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(reason) => {
                error!("Failed to start advertising: {}", reason);
                self.teardown(ProtocolError::AdvertiseFailed(reason).into());
            }
        }
    }

    fn publish(&mut self) {
        debug!("Publishing key exchange service");
        self.state = AdvertiserState::Publishing;
        self.host.start_advertising(self.slot.clone());
    }

    /// Return to idle, completing a pending reply with `err`.
    fn teardown(&mut self, err: BleError) {
        if matches!(
            self.state,
            AdvertiserState::Publishing | AdvertiserState::Advertising
        ) {
            self.host.stop_advertising();
        }
        self.slot.clear();
        self.state = AdvertiserState::Idle;
        if let Some(reply) = self.pending.take() {
            let _ = reply.send(Err(err));
        }
    }
}
