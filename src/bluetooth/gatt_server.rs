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

//! BLE GATT server for the key exchange service.

use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::Adapter;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::advertiser::{AttributeError, PayloadSlot};
use super::ble_constants::*;
use super::bluez::spawn_adapter_monitor;
use super::host::PeripheralHost;
use super::types::PeripheralEvent;

fn req_error(error: AttributeError) -> ReqError {
    match error {
        AttributeError::NotFound => ReqError::NotSupported,
        AttributeError::InvalidValue => ReqError::Failed,
        AttributeError::NotPermitted => ReqError::NotPermitted,
    }
}

fn readable(uuid: Uuid, slot: &PayloadSlot) -> CharacteristicRead {
    let slot = slot.clone();
    CharacteristicRead {
        read: true,
        fun: Box::new(move |_req: CharacteristicReadRequest| {
            let result = slot.read(uuid).map_err(req_error);
            Box::pin(async move { result })
        }),
        ..Default::default()
    }
}

fn writable(uuid: Uuid, slot: &PayloadSlot) -> CharacteristicWrite {
    let slot = slot.clone();
    CharacteristicWrite {
        write: true,
        method: CharacteristicWriteMethod::Fun(Box::new(
            move |value: Vec<u8>, _req: CharacteristicWriteRequest| {
                let result = slot.write(uuid, &value).map_err(req_error);
                if result.is_ok() {
                    debug!("Peer updated {}", uuid);
                }
                Box::pin(async move { result })
            },
        )),
        ..Default::default()
    }
}

/// The key exchange service with every characteristic answered from `slot`.
fn key_application(slot: &PayloadSlot) -> Application {
    let characteristics = vec![
        Characteristic {
            uuid: PUBLIC_KEY_UUID,
            read: Some(readable(PUBLIC_KEY_UUID, slot)),
            write: Some(writable(PUBLIC_KEY_UUID, slot)),
            ..Default::default()
        },
        Characteristic {
            uuid: SIGNATURE_UUID,
            read: Some(readable(SIGNATURE_UUID, slot)),
            write: Some(writable(SIGNATURE_UUID, slot)),
            ..Default::default()
        },
        Characteristic {
            uuid: MESSAGE_UUID,
            read: Some(readable(MESSAGE_UUID, slot)),
            ..Default::default()
        },
    ];

    Application {
        services: vec![Service {
            uuid: KEY_SERVICE_UUID,
            primary: true,
            characteristics,
            ..Default::default()
        }],
        ..Default::default()
    }
}

struct Published {
    _app: ApplicationHandle,
    _adv: AdvertisementHandle,
}

/// Bump the generation and drop whatever is published, under one lock.
fn supersede<T>(published: &Mutex<Option<T>>, current: &AtomicU64) -> (u64, Option<T>) {
    let mut guard = published.lock();
    let generation = current.fetch_add(1, Ordering::SeqCst) + 1;
    (generation, guard.take())
}

/// Store `handles` unless a later start or stop has superseded `generation`.
/// The check and the store share the lock `supersede` takes.
fn store_if_current<T>(
    published: &Mutex<Option<T>>,
    current: &AtomicU64,
    generation: u64,
    handles: T,
) -> bool {
    let mut guard = published.lock();
    if current.load(Ordering::SeqCst) != generation {
        return false;
    }
    *guard = Some(handles);
    true
}

/// Peripheral role on a BlueZ adapter.
pub struct GattServer {
    adapter: Adapter,
    local_name: String,
    events: mpsc::UnboundedSender<PeripheralEvent>,
    /// Bumped on every start and stop so a superseded start cannot report.
    generation: Arc<AtomicU64>,
    published: Arc<Mutex<Option<Published>>>,
    start_task: Option<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

impl GattServer {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        adapter: Adapter,
        local_name: &str,
        events: mpsc::UnboundedSender<PeripheralEvent>,
    ) -> Self {
        let monitor = {
            let events = events.clone();
            spawn_adapter_monitor(adapter.clone(), move |state| {
                let _ = events.send(PeripheralEvent::AdapterStateChanged(state));
            })
        };
        Self {
            adapter,
            local_name: local_name.to_string(),
            events,
            generation: Arc::new(AtomicU64::new(0)),
            published: Arc::new(Mutex::new(None)),
            start_task: None,
            monitor,
        }
    }

    /// Abort any in-flight start and withdraw the current advertisement.
    /// Returns the new generation and whether something was published.
    fn cancel_pending(&mut self) -> (u64, bool) {
        if let Some(task) = self.start_task.take() {
            task.abort();
        }
        let (generation, withdrawn) = supersede(&self.published, &self.generation);
        (generation, withdrawn.is_some())
    }
}

impl Drop for GattServer {
    fn drop(&mut self) {
        self.monitor.abort();
        self.cancel_pending();
    }
}

impl PeripheralHost for GattServer {
    fn start_advertising(&mut self, slot: PayloadSlot) {
        let (generation, _) = self.cancel_pending();

        let adapter = self.adapter.clone();
        let local_name = self.local_name.clone();
        let events = self.events.clone();
        let current = self.generation.clone();
        let published = self.published.clone();

        self.start_task = Some(tokio::spawn(async move {
            let result = async {
                let app = adapter.serve_gatt_application(key_application(&slot)).await?;
                debug!("Key exchange service registered");

                let adv = Advertisement {
                    service_uuids: vec![KEY_SERVICE_UUID].into_iter().collect(),
                    discoverable: Some(true),
                    local_name: Some(local_name),
                    ..Default::default()
                };
                let adv = adapter.advertise(adv).await?;
                Ok::<_, bluer::Error>(Published {
                    _app: app,
                    _adv: adv,
                })
            }
            .await;

            match result {
                Ok(handles) => {
                    if !store_if_current(&published, &current, generation, handles) {
                        debug!("Dropping superseded advertising start");
                        return;
                    }
                    info!("BLE advertising started");
                    let _ = events.send(PeripheralEvent::AdvertisingStarted(Ok(())));
                }
                Err(_) if current.load(Ordering::SeqCst) != generation => {
                    debug!("Dropping superseded advertising failure");
                }
                Err(e) => {
                    warn!("Failed to start advertising: {}", e);
                    let _ = events.send(PeripheralEvent::AdvertisingStarted(Err(e.to_string())));
                }
            }
        }));
    }

    fn stop_advertising(&mut self) {
        let (_, withdrawn) = self.cancel_pending();
        if withdrawn {
            info!("BLE advertising stopped");
        }
    }
}
