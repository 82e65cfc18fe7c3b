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

//! BlueZ central role binding.
//!
//! Every [`CentralHost`] call spawns a task that talks to BlueZ and sends the
//! outcome back as a [`CentralEvent`]. Nothing here blocks the engine.

use anyhow::Result;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Service};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::host::CentralHost;
use super::types::{AdapterState, CentralEvent, DiscoveredDevice, PeripheralId};

const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

/// Open a BlueZ session and return the default adapter, powered on.
pub async fn default_adapter() -> Result<Adapter> {
    let session = bluer::Session::new().await?;
    debug!("BlueZ session created");

    let adapter = session.default_adapter().await?;
    info!("Using Bluetooth adapter: {}", adapter.name());

    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter: {}", e);
        }
    }
    Ok(adapter)
}

/// Report the adapter's power state now and on every change.
pub fn spawn_adapter_monitor<F>(adapter: Adapter, report: F) -> JoinHandle<()>
where
    F: Fn(AdapterState) + Send + 'static,
{
    tokio::spawn(async move {
        let initial = match adapter.is_powered().await {
            Ok(true) => AdapterState::PoweredOn,
            Ok(false) => AdapterState::PoweredOff,
            Err(e) => {
                warn!("Adapter state unavailable: {}", e);
                AdapterState::Unsupported
            }
        };
        report(initial);

        let events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Cannot watch adapter {}: {}", adapter.name(), e);
                return;
            }
        };
        pin_mut!(events);
        while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                info!("Adapter {} powered: {}", adapter.name(), powered);
                report(if powered {
                    AdapterState::PoweredOn
                } else {
                    AdapterState::PoweredOff
                });
            }
        }
        debug!("Adapter event stream ended");
    })
}

struct Link {
    device: Device,
    connected: bool,
    services: HashMap<Uuid, Service>,
    characteristics: HashMap<Uuid, Characteristic>,
    tasks: Vec<JoinHandle<()>>,
}

impl Link {
    fn new(device: Device) -> Self {
        Self {
            device,
            connected: false,
            services: HashMap::new(),
            characteristics: HashMap::new(),
            tasks: Vec::new(),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type Links = Arc<Mutex<HashMap<PeripheralId, Link>>>;

/// Central role on a BlueZ adapter.
pub struct BluezCentral {
    adapter: Adapter,
    events: mpsc::UnboundedSender<CentralEvent>,
    links: Links,
    scan_task: Option<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

impl BluezCentral {
    /// Must be called inside a Tokio runtime.
    pub fn new(adapter: Adapter, events: mpsc::UnboundedSender<CentralEvent>) -> Self {
        let monitor = {
            let events = events.clone();
            spawn_adapter_monitor(adapter.clone(), move |state| {
                let _ = events.send(CentralEvent::AdapterStateChanged(state));
            })
        };
        Self {
            adapter,
            events,
            links: Arc::new(Mutex::new(HashMap::new())),
            scan_task: None,
            monitor,
        }
    }

    fn emit(&self, event: CentralEvent) {
        let _ = self.events.send(event);
    }

    fn device(&self, id: &PeripheralId) -> Result<Device> {
        let address: Address = id.as_str().parse()?;
        Ok(self.adapter.device(address)?)
    }

    fn characteristic(&self, id: &PeripheralId, uuid: Uuid) -> Option<Characteristic> {
        self.links
            .lock()
            .get(id)
            .and_then(|link| link.characteristics.get(&uuid).cloned())
    }
}

impl Drop for BluezCentral {
    fn drop(&mut self) {
        self.monitor.abort();
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}

async fn describe(device: &Device) -> bluer::Result<DiscoveredDevice> {
    let id = PeripheralId::new(device.address().to_string());
    let name = device.name().await?;
    let rssi = device.rssi().await?.unwrap_or(i16::MIN);

    let mut discovered = DiscoveredDevice::new(id, name, rssi);
    for (uuid, data) in device.service_data().await?.unwrap_or_default() {
        discovered
            .advertisement
            .insert(format!("service:{}", uuid), data);
    }
    for (company, data) in device.manufacturer_data().await?.unwrap_or_default() {
        discovered
            .advertisement
            .insert(format!("manufacturer:{:04x}", company), data);
    }
    Ok(discovered)
}

async fn advertises_any(device: &Device, services: &HashSet<Uuid>) -> bool {
    if services.is_empty() {
        return true;
    }
    match device.uuids().await {
        Ok(Some(uuids)) => !uuids.is_disjoint(services),
        _ => false,
    }
}

async fn scan(
    adapter: Adapter,
    services: HashSet<Uuid>,
    events: mpsc::UnboundedSender<CentralEvent>,
) {
    // Service filtering happens here rather than in BlueZ: both roles share one
    // D-Bus client and a filter set by one would narrow the other.
    let filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        ..Default::default()
    };
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    let stream = match adapter.discover_devices_with_changes().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to start discovery: {}", e);
            return;
        }
    };
    pin_mut!(stream);
    debug!("Discovery started");

    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let Ok(device) = adapter.device(address) else {
            continue;
        };
        if !advertises_any(&device, &services).await {
            continue;
        }
        match describe(&device).await {
            Ok(discovered) => {
                let _ = events.send(CentralEvent::Discovered(discovered));
            }
            Err(e) => debug!("Ignoring {}: {}", address, e),
        }
    }
}

fn spawn_disconnect_monitor(
    device: Device,
    id: PeripheralId,
    links: Links,
    events: mpsc::UnboundedSender<CentralEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = match device.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot watch {}: {}", id, e);
                return;
            }
        };
        pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                info!("Device {} disconnected", id);
                let _ = events.send(CentralEvent::Disconnected {
                    id: id.clone(),
                    reason: None,
                });
                // Dropping the link aborts this task, so it goes last.
                links.lock().remove(&id);
                return;
            }
        }
    })
}

async fn wait_services_resolved(device: &Device) -> bluer::Result<bool> {
    let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
    while !device.is_services_resolved().await? {
        if tokio::time::Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
    }
    Ok(true)
}

impl CentralHost for BluezCentral {
    fn start_scan(&mut self, services: &[Uuid]) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        let services = services.iter().copied().collect();
        self.scan_task = Some(tokio::spawn(scan(
            self.adapter.clone(),
            services,
            self.events.clone(),
        )));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
            debug!("Discovery stopped");
        }
    }

    fn connect(&mut self, id: &PeripheralId) {
        let existing = self.links.lock().get(id).map(|link| link.connected);
        match existing {
            Some(true) => {
                debug!("Already connected to {}", id);
                self.emit(CentralEvent::Connected(id.clone()));
                return;
            }
            Some(false) => {
                debug!("Already connecting to {}", id);
                return;
            }
            None => {}
        }
        let device = match self.device(id) {
            Ok(device) => device,
            Err(e) => {
                self.emit(CentralEvent::ConnectFailed {
                    id: id.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.links
            .lock()
            .insert(id.clone(), Link::new(device.clone()));

        let links = self.links.clone();
        let events = self.events.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let id = task_id;
            match device.connect().await {
                Ok(()) => {
                    let monitor = spawn_disconnect_monitor(
                        device,
                        id.clone(),
                        links.clone(),
                        events.clone(),
                    );
                    match links.lock().get_mut(&id) {
                        Some(link) => {
                            link.connected = true;
                            link.tasks.push(monitor);
                        }
                        None => {
                            monitor.abort();
                            return;
                        }
                    }
                    let _ = events.send(CentralEvent::Connected(id));
                }
                Err(e) => {
                    let _ = events.send(CentralEvent::ConnectFailed {
                        id: id.clone(),
                        reason: e.to_string(),
                    });
                    links.lock().remove(&id);
                }
            }
        });
        // The task may already have finished and removed the link.
        match self.links.lock().get_mut(id) {
            Some(link) => link.tasks.push(task),
            None => drop(task),
        }
    }

    fn disconnect(&mut self, id: &PeripheralId) {
        let link = self
            .links
            .lock()
            .get(id)
            .map(|link| (link.device.clone(), link.connected));
        match link {
            None => debug!("Disconnect from {}: not connected", id),
            Some((device, true)) => {
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(e) = device.disconnect().await {
                        warn!("Failed to disconnect {}: {}", id, e);
                    }
                });
            }
            Some((_, false)) => {
                self.links.lock().remove(id);
                self.emit(CentralEvent::Disconnected {
                    id: id.clone(),
                    reason: None,
                });
            }
        }
    }

    fn discover_services(&mut self, id: &PeripheralId, services: &[Uuid]) {
        let Some(device) = self.links.lock().get(id).map(|link| link.device.clone()) else {
            self.emit(CentralEvent::ServicesDiscovered {
                id: id.clone(),
                services: Err("not connected".into()),
            });
            return;
        };

        let wanted: HashSet<Uuid> = services.iter().copied().collect();
        let links = self.links.clone();
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = async {
                if !wait_services_resolved(&device).await? {
                    debug!("Services of {} not resolved in time", id);
                }
                let mut found = HashMap::new();
                for service in device.services().await? {
                    let uuid = service.uuid().await?;
                    if wanted.is_empty() || wanted.contains(&uuid) {
                        found.insert(uuid, service);
                    }
                }
                Ok::<_, bluer::Error>(found)
            }
            .await;

            let services = match result {
                Ok(found) => {
                    let uuids = found.keys().copied().collect();
                    if let Some(link) = links.lock().get_mut(&id) {
                        link.services = found;
                    }
                    Ok(uuids)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(CentralEvent::ServicesDiscovered { id, services });
        });
    }

    fn discover_characteristics(
        &mut self,
        id: &PeripheralId,
        service: Uuid,
        characteristics: &[Uuid],
    ) {
        let remote = self
            .links
            .lock()
            .get(id)
            .and_then(|link| link.services.get(&service).cloned());
        let Some(remote) = remote else {
            self.emit(CentralEvent::CharacteristicsDiscovered {
                id: id.clone(),
                service,
                characteristics: Err("service not discovered".into()),
            });
            return;
        };

        let wanted: HashSet<Uuid> = characteristics.iter().copied().collect();
        let links = self.links.clone();
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = async {
                let mut found = HashMap::new();
                for characteristic in remote.characteristics().await? {
                    let uuid = characteristic.uuid().await?;
                    if wanted.is_empty() || wanted.contains(&uuid) {
                        found.insert(uuid, characteristic);
                    }
                }
                Ok::<_, bluer::Error>(found)
            }
            .await;

            let characteristics = match result {
                Ok(found) => {
                    let uuids = found.keys().copied().collect();
                    if let Some(link) = links.lock().get_mut(&id) {
                        link.characteristics.extend(found);
                    }
                    Ok(uuids)
                }
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(CentralEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            });
        });
    }

    fn read(&mut self, id: &PeripheralId, characteristic: Uuid) {
        let Some(remote) = self.characteristic(id, characteristic) else {
            self.emit(CentralEvent::ValueUpdated {
                id: id.clone(),
                characteristic,
                value: Err("characteristic not discovered".into()),
            });
            return;
        };
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let value = remote.read().await.map_err(|e| e.to_string());
            let _ = events.send(CentralEvent::ValueUpdated {
                id,
                characteristic,
                value,
            });
        });
    }

    fn subscribe(&mut self, id: &PeripheralId, characteristic: Uuid) {
        let Some(remote) = self.characteristic(id, characteristic) else {
            warn!("Cannot subscribe to {} on {}: not discovered", characteristic, id);
            return;
        };
        let events = self.events.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let id = task_id;
            let stream = match remote.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Subscribe to {} on {} failed: {}", characteristic, id, e);
                    return;
                }
            };
            pin_mut!(stream);
            debug!("Subscribed to {} on {}", characteristic, id);
            while let Some(value) = stream.next().await {
                let _ = events.send(CentralEvent::ValueUpdated {
                    id: id.clone(),
                    characteristic,
                    value: Ok(value),
                });
            }
        });
        match self.links.lock().get_mut(id) {
            Some(link) => link.tasks.push(task),
            None => task.abort(),
        }
    }

    fn write(&mut self, id: &PeripheralId, characteristic: Uuid, value: Vec<u8>) {
        let Some(remote) = self.characteristic(id, characteristic) else {
            self.emit(CentralEvent::WriteCompleted {
                id: id.clone(),
                characteristic,
                result: Err("characteristic not discovered".into()),
            });
            return;
        };
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let request = CharacteristicWriteRequest {
                op_type: WriteOp::Request,
                ..Default::default()
            };
            let result = remote
                .write_ext(&value, &request)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(CentralEvent::WriteCompleted {
                id,
                characteristic,
                result,
            });
        });
    }
}
