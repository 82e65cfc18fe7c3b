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

//! Scanner role: finds a nearby advertiser and reads its key payload.

use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::*;
use super::codec::KeyPayload;
use super::host::CentralHost;
use super::types::{sort_by_signal, AdapterState, CentralEvent, DiscoveredDevice, PeripheralId};
use crate::error::{BleError, DecodeError, ProtocolError};

/// Receives the full, sorted device list after every discovery.
pub type DeviceListSender = mpsc::UnboundedSender<Vec<DiscoveredDevice>>;

/// Completion of a `connect_and_read_key` call.
pub type KeyReply = oneshot::Sender<Result<KeyPayload, BleError>>;

const KEY_CHARACTERISTICS: [Uuid; 3] = [PUBLIC_KEY_UUID, SIGNATURE_UUID, MESSAGE_UUID];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringService,
    DiscoveringCharacteristics,
    Reading,
}

/// Fields received so far on the current connection.
#[derive(Debug, Default)]
struct PartialPayload {
    public_key: Option<String>,
    signature: Option<String>,
    message: Option<String>,
}

impl PartialPayload {
    fn set(&mut self, characteristic: Uuid, value: String) {
        match characteristic {
            PUBLIC_KEY_UUID => self.public_key = Some(value),
            SIGNATURE_UUID => self.signature = Some(value),
            MESSAGE_UUID => self.message = Some(value),
            _ => {}
        }
    }

    /// Take the payload once every field has arrived.
    fn complete(&mut self) -> Option<KeyPayload> {
        if self.public_key.is_some() && self.signature.is_some() && self.message.is_some() {
            Some(KeyPayload {
                public_key: self.public_key.take()?,
                signature: self.signature.take()?,
                message: self.message.take()?,
            })
        } else {
            None
        }
    }
}

/// Scratch state of one key exchange connection.
struct Session {
    id: PeripheralId,
    reply: KeyReply,
    partial: PartialPayload,
    characteristics: HashSet<Uuid>,
    /// Whether `connect` reached the host; false while waiting for power.
    link_requested: bool,
}

/// Scanner/connector state machine.
pub struct KeyScanner {
    host: Box<dyn CentralHost>,
    adapter: AdapterState,
    state: ScannerState,
    scan_active: bool,
    devices: HashMap<PeripheralId, DiscoveredDevice>,
    list_tx: Option<DeviceListSender>,
    session: Option<Session>,
    /// Peripherals we disconnected ourselves; their teardown is not an error.
    closing: HashSet<PeripheralId>,
}

impl KeyScanner {
    pub fn new(host: Box<dyn CentralHost>) -> Self {
        Self {
            host,
            adapter: AdapterState::Unknown,
            state: ScannerState::Idle,
            scan_active: false,
            devices: HashMap::new(),
            list_tx: None,
            session: None,
            closing: HashSet::new(),
        }
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Current device table, strongest first.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut list: Vec<DiscoveredDevice> = self.devices.values().cloned().collect();
        sort_by_signal(&mut list);
        list
    }

    /// Start scanning for advertisers of the key exchange service.
    pub fn scan_for_keys(&mut self, list_tx: DeviceListSender) -> Result<(), BleError> {
        if self.adapter.is_unavailable() {
            error!("Cannot scan: adapter {}", self.adapter);
            return Err(BleError::AdapterUnavailable(self.adapter));
        }
        if self.session.is_some() {
            return Err(BleError::Busy);
        }

        self.devices.clear();
        self.list_tx = Some(list_tx);
        self.state = ScannerState::Scanning;

        if self.adapter == AdapterState::PoweredOn {
            self.begin_scan();
        } else {
            info!("Adapter not ready, deferring key scan");
        }
        Ok(())
    }

    /// Stop scanning and forget discovered devices. Safe to call in any state.
    pub fn stop_scanning(&mut self) {
        if self.scan_active {
            self.host.stop_scan();
            self.scan_active = false;
        }
        if self.state == ScannerState::Scanning {
            self.state = ScannerState::Idle;
        }
        self.devices.clear();
        self.list_tx = None;
    }

    /// Connect to `id` and read its key payload.
    pub fn connect_and_read_key(&mut self, id: PeripheralId, reply: KeyReply) {
        if self.session.is_some() {
            warn!("Key exchange already in progress, refusing {}", id);
            let _ = reply.send(Err(BleError::Busy));
            return;
        }
        if self.adapter.is_unavailable() {
            error!("Cannot connect: adapter {}", self.adapter);
            let _ = reply.send(Err(BleError::AdapterUnavailable(self.adapter)));
            return;
        }

        self.stop_scanning();
        self.closing.remove(&id);
        self.state = ScannerState::Connecting;
        self.session = Some(Session {
            id,
            reply,
            partial: PartialPayload::default(),
            characteristics: HashSet::new(),
            link_requested: false,
        });

        if self.adapter == AdapterState::PoweredOn {
            self.request_link();
        } else {
            info!("Adapter not ready, deferring key exchange connect");
        }
    }

    /// Tear down the current connection, if any. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            info!("Key exchange cancelled");
            self.finish(Err(BleError::Cancelled));
        } else {
            self.stop_scanning();
        }
    }

    pub fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            CentralEvent::Discovered(device) => self.on_discovered(device),
            CentralEvent::Connected(id) => {
                if self.is_current(&id, ScannerState::Connecting) {
                    debug!("Connected to {}, discovering service", id);
                    self.state = ScannerState::DiscoveringService;
                    self.host.discover_services(&id, &[KEY_SERVICE_UUID]);
                }
            }
            CentralEvent::ConnectFailed { id, reason } => {
                if self.is_current(&id, ScannerState::Connecting) {
                    error!("Connection to {} failed: {}", id, reason);
                    self.abandon(Err(ProtocolError::ConnectFailed(reason).into()));
                }
            }
            CentralEvent::Disconnected { id, reason } => self.on_disconnected(id, reason),
            CentralEvent::ServicesDiscovered { id, services } => {
                if self.is_current(&id, ScannerState::DiscoveringService) {
                    self.on_services(id, services);
                }
            }
            CentralEvent::CharacteristicsDiscovered {
                id,
                characteristics,
                ..
            } => {
                if self.is_current(&id, ScannerState::DiscoveringCharacteristics) {
                    self.on_characteristics(id, characteristics);
                }
            }
            CentralEvent::ValueUpdated {
                id,
                characteristic,
                value,
            } => {
                if self.is_current(&id, ScannerState::Reading) {
                    self.on_value(characteristic, value);
                } else {
                    debug!("Dropping late value from {}", id);
                }
            }
            CentralEvent::WriteCompleted { .. } => {}
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        debug!("Scanner adapter state: {}", state);
        self.adapter = state;

        if state == AdapterState::PoweredOn {
            if self.state == ScannerState::Scanning && !self.scan_active {
                self.begin_scan();
            }
            if self.state == ScannerState::Connecting {
                self.request_link();
            }
        } else if state.is_unavailable() {
            // The host has stopped everything; nothing left to tear down there.
            self.scan_active = false;
            if self.session.is_some() {
                warn!("Adapter became {} during key exchange", state);
                self.abandon(Err(BleError::AdapterUnavailable(state)));
            } else {
                self.stop_scanning();
            }
        }
    }

    fn on_discovered(&mut self, device: DiscoveredDevice) {
        if self.state != ScannerState::Scanning {
            return;
        }
        debug!("Discovered {} ({} dBm)", device.id, device.rssi);
        self.devices.insert(device.id.clone(), device);

        let snapshot = self.devices();
        if let Some(tx) = &self.list_tx {
            if tx.send(snapshot).is_err() {
                debug!("Device list receiver dropped");
            }
        }
    }

    fn on_disconnected(&mut self, id: PeripheralId, reason: Option<String>) {
        if self.closing.remove(&id) {
            if let Some(reason) = reason {
                debug!("Teardown of {} reported: {}", id, reason);
            }
            return;
        }
        if self.session.as_ref().map(|s| &s.id) == Some(&id) {
            warn!("{} disconnected during key exchange", id);
            self.abandon(Err(ProtocolError::UnexpectedDisconnect.into()));
        }
    }

    fn on_services(&mut self, id: PeripheralId, services: Result<Vec<Uuid>, String>) {
        match services {
            Ok(services) if services.contains(&KEY_SERVICE_UUID) => {
                debug!("Key service found on {}", id);
                self.state = ScannerState::DiscoveringCharacteristics;
                self.host
                    .discover_characteristics(&id, KEY_SERVICE_UUID, &KEY_CHARACTERISTICS);
            }
            Ok(_) => {
                error!("{} has no key exchange service", id);
                self.finish(Err(ProtocolError::ServiceNotFound.into()));
            }
            Err(reason) => {
                error!("Service discovery on {} failed: {}", id, reason);
                self.finish(Err(ProtocolError::ServiceNotFound.into()));
            }
        }
    }

    fn on_characteristics(&mut self, id: PeripheralId, found: Result<Vec<Uuid>, String>) {
        let found = match found {
            Ok(found) => found,
            Err(reason) => {
                error!("Characteristic discovery on {} failed: {}", id, reason);
                self.finish(Err(ProtocolError::CharacteristicNotFound("key").into()));
                return;
            }
        };

        for (uuid, name) in [
            (PUBLIC_KEY_UUID, "public key"),
            (SIGNATURE_UUID, "signature"),
            (MESSAGE_UUID, "message"),
        ] {
            if !found.contains(&uuid) {
                error!("{} is missing the {} characteristic", id, name);
                self.finish(Err(ProtocolError::CharacteristicNotFound(name).into()));
                return;
            }
        }

        self.state = ScannerState::Reading;
        if let Some(session) = self.session.as_mut() {
            session.characteristics.extend(KEY_CHARACTERISTICS);
        }
        for uuid in KEY_CHARACTERISTICS {
            self.host.read(&id, uuid);
        }
    }

    fn on_value(&mut self, characteristic: Uuid, value: Result<Vec<u8>, String>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.characteristics.contains(&characteristic) {
            debug!("Ignoring value for {}", characteristic);
            return;
        }

        let bytes = match value {
            Ok(bytes) => bytes,
            Err(reason) => {
                error!("Read of {} failed: {}", characteristic, reason);
                self.finish(Err(ProtocolError::ReadFailed(reason).into()));
                return;
            }
        };
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => {
                error!("Undecodable value for {}", characteristic);
                self.finish(Err(DecodeError::from(e).into()));
                return;
            }
        };

        session.partial.set(characteristic, text);
        if let Some(payload) = session.partial.complete() {
            info!("Key payload received from {}", session.id);
            self.finish(Ok(payload));
        }
    }

    /// Deliver the result, disconnect, and drop all per-connection state.
    fn finish(&mut self, result: Result<KeyPayload, BleError>) {
        self.close(result, true);
    }

    /// Like `finish`, for a link the host has already dropped.
    fn abandon(&mut self, result: Result<KeyPayload, BleError>) {
        self.close(result, false);
    }

    fn close(&mut self, result: Result<KeyPayload, BleError>, teardown: bool) {
        let Some(session) = self.session.take() else {
            return;
        };
        // Only a teardown we start is followed by a Disconnected to swallow.
        if teardown && session.link_requested {
            self.host.disconnect(&session.id);
            self.closing.insert(session.id);
        }
        self.state = ScannerState::Idle;
        let _ = session.reply.send(result);
    }

    fn request_link(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.link_requested {
            return;
        }
        info!("Connecting to {} for key exchange", session.id);
        session.link_requested = true;
        self.host.connect(&session.id);
    }

    fn is_current(&self, id: &PeripheralId, state: ScannerState) -> bool {
        self.state == state && self.session.as_ref().map(|s| &s.id) == Some(id)
    }

    fn begin_scan(&mut self) {
        info!("Scanning for key exchange advertisers");
        self.host.start_scan(&[KEY_SERVICE_UUID]);
        self.scan_active = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::testing::{CentralCall, MockCentral};

    fn scanner() -> (KeyScanner, MockCentral) {
        let host = MockCentral::default();
        let mut scanner = KeyScanner::new(Box::new(host.clone()));
        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
        (scanner, host)
    }

    fn device(id: &str, rssi: i16) -> DiscoveredDevice {
        DiscoveredDevice::new(PeripheralId::new(id), Some(id.to_string()), rssi)
    }

    /// Drive a connection up to the point where all three reads are issued.
    fn connect_to_reading(
        scanner: &mut KeyScanner,
    ) -> (PeripheralId, oneshot::Receiver<Result<KeyPayload, BleError>>) {
        let id = PeripheralId::new("phone");
        let (tx, rx) = oneshot::channel();
        scanner.connect_and_read_key(id.clone(), tx);
        scanner.handle_event(CentralEvent::Connected(id.clone()));
        scanner.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: Ok(vec![KEY_SERVICE_UUID]),
        });
        scanner.handle_event(CentralEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service: KEY_SERVICE_UUID,
            characteristics: Ok(KEY_CHARACTERISTICS.to_vec()),
        });
        (id, rx)
    }

    fn value(id: &PeripheralId, characteristic: Uuid, text: &str) -> CentralEvent {
        CentralEvent::ValueUpdated {
            id: id.clone(),
            characteristic,
            value: Ok(text.as_bytes().to_vec()),
        }
    }

    fn field_for(uuid: Uuid) -> &'static str {
        match uuid {
            PUBLIC_KEY_UUID => "02ab",
            SIGNATURE_UUID => "3045",
            _ => "hello",
        }
    }

    #[test]
    fn test_snapshot_sorted_by_signal() {
        let (mut scanner, host) = scanner();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scanner.scan_for_keys(tx).unwrap();
        assert_eq!(host.calls(), vec![CentralCall::StartScan(vec![KEY_SERVICE_UUID])]);

        scanner.handle_event(CentralEvent::Discovered(device("a", -80)));
        scanner.handle_event(CentralEvent::Discovered(device("b", -40)));
        scanner.handle_event(CentralEvent::Discovered(device("c", -60)));

        let mut last = Vec::new();
        let mut updates = 0;
        while let Ok(list) = rx.try_recv() {
            updates += 1;
            last = list;
        }
        assert_eq!(updates, 3);
        let rssi: Vec<i16> = last.iter().map(|d| d.rssi).collect();
        assert_eq!(rssi, vec![-40, -60, -80]);
    }

    #[test]
    fn test_rediscovery_replaces_entry() {
        let (mut scanner, _host) = scanner();
        let (tx, mut rx) = mpsc::unbounded_channel();
        scanner.scan_for_keys(tx).unwrap();

        scanner.handle_event(CentralEvent::Discovered(device("a", -80)));
        scanner.handle_event(CentralEvent::Discovered(device("b", -50)));
        scanner.handle_event(CentralEvent::Discovered(device("a", -30)));

        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].id, PeripheralId::new("a"));
        assert_eq!(last[0].rssi, -30);
    }

    #[test]
    fn test_stop_scanning_clears_table_and_is_idempotent() {
        let (mut scanner, host) = scanner();
        let (tx, _rx) = mpsc::unbounded_channel();
        scanner.scan_for_keys(tx).unwrap();
        scanner.handle_event(CentralEvent::Discovered(device("a", -70)));

        scanner.stop_scanning();
        scanner.stop_scanning();
        assert!(scanner.devices().is_empty());
        assert_eq!(host.count(|c| *c == CentralCall::StopScan), 1);

        // Discoveries after stopping are dropped.
        scanner.handle_event(CentralEvent::Discovered(device("b", -70)));
        assert!(scanner.devices().is_empty());
    }

    #[test]
    fn test_scan_deferred_until_powered_on() {
        let host = MockCentral::default();
        let mut scanner = KeyScanner::new(Box::new(host.clone()));
        let (tx, _rx) = mpsc::unbounded_channel();

        scanner.scan_for_keys(tx).unwrap();
        assert!(host.calls().is_empty());

        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(host.calls(), vec![CentralCall::StartScan(vec![KEY_SERVICE_UUID])]);
    }

    #[test]
    fn test_scan_fails_when_adapter_off() {
        let host = MockCentral::default();
        let mut scanner = KeyScanner::new(Box::new(host));
        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOff));
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            scanner.scan_for_keys(tx),
            Err(BleError::AdapterUnavailable(AdapterState::PoweredOff))
        );
    }

    #[test]
    fn test_completes_for_every_read_order() {
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for order in orders {
            let (mut scanner, host) = scanner();
            let (id, mut rx) = connect_to_reading(&mut scanner);

            for (n, idx) in order.iter().enumerate() {
                let uuid = KEY_CHARACTERISTICS[*idx];
                assert!(rx.try_recv().is_err(), "result before all fields ({:?})", order);
                scanner.handle_event(value(&id, uuid, field_for(uuid)));
                if n < 2 {
                    assert_eq!(scanner.state(), ScannerState::Reading);
                }
            }

            assert_eq!(
                rx.try_recv().unwrap(),
                Ok(KeyPayload::new("02ab", "3045", "hello")),
                "order {:?}",
                order
            );
            assert_eq!(host.count(|c| *c == CentralCall::Disconnect(id.clone())), 1);
            assert_eq!(scanner.state(), ScannerState::Idle);
        }
    }

    #[test]
    fn test_duplicate_field_does_not_complete() {
        let (mut scanner, _host) = scanner();
        let (id, mut rx) = connect_to_reading(&mut scanner);

        scanner.handle_event(value(&id, PUBLIC_KEY_UUID, "02ab"));
        scanner.handle_event(value(&id, PUBLIC_KEY_UUID, "02ab"));
        scanner.handle_event(value(&id, SIGNATURE_UUID, "3045"));
        assert!(rx.try_recv().is_err());

        scanner.handle_event(value(&id, MESSAGE_UUID, "hello"));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_reads_issued_for_all_characteristics() {
        let (mut scanner, host) = scanner();
        let (id, _rx) = connect_to_reading(&mut scanner);
        for uuid in KEY_CHARACTERISTICS {
            assert_eq!(host.count(|c| *c == CentralCall::Read(id.clone(), uuid)), 1);
        }
    }

    #[test]
    fn test_late_value_after_completion_is_dropped() {
        let (mut scanner, _host) = scanner();
        let (id, mut rx) = connect_to_reading(&mut scanner);
        for uuid in KEY_CHARACTERISTICS {
            scanner.handle_event(value(&id, uuid, field_for(uuid)));
        }
        assert!(rx.try_recv().unwrap().is_ok());

        scanner.handle_event(value(&id, MESSAGE_UUID, "late"));
        assert_eq!(scanner.state(), ScannerState::Idle);
    }

    #[test]
    fn test_teardown_error_after_success_not_reported() {
        let (mut scanner, _host) = scanner();
        let (id, mut rx) = connect_to_reading(&mut scanner);
        for uuid in KEY_CHARACTERISTICS {
            scanner.handle_event(value(&id, uuid, field_for(uuid)));
        }
        assert!(rx.try_recv().unwrap().is_ok());

        scanner.handle_event(CentralEvent::Disconnected {
            id,
            reason: Some("connection terminated".into()),
        });
        assert_eq!(scanner.state(), ScannerState::Idle);
    }

    #[test]
    fn test_missing_service_fails_once() {
        let (mut scanner, host) = scanner();
        let id = PeripheralId::new("phone");
        let (tx, mut rx) = oneshot::channel();
        scanner.connect_and_read_key(id.clone(), tx);
        scanner.handle_event(CentralEvent::Connected(id.clone()));
        scanner.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: Ok(vec![WAND_SERVICE_UUID]),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::Protocol(ProtocolError::ServiceNotFound))
        );
        assert_eq!(host.count(|c| *c == CentralCall::Disconnect(id.clone())), 1);

        // A stray disconnect afterwards changes nothing.
        scanner.handle_event(CentralEvent::Disconnected { id, reason: None });
        assert_eq!(scanner.state(), ScannerState::Idle);
    }

    #[test]
    fn test_missing_characteristic_fails() {
        let (mut scanner, _host) = scanner();
        let id = PeripheralId::new("phone");
        let (tx, mut rx) = oneshot::channel();
        scanner.connect_and_read_key(id.clone(), tx);
        scanner.handle_event(CentralEvent::Connected(id.clone()));
        scanner.handle_event(CentralEvent::ServicesDiscovered {
            id: id.clone(),
            services: Ok(vec![KEY_SERVICE_UUID]),
        });
        scanner.handle_event(CentralEvent::CharacteristicsDiscovered {
            id,
            service: KEY_SERVICE_UUID,
            characteristics: Ok(vec![PUBLIC_KEY_UUID, MESSAGE_UUID]),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::Protocol(ProtocolError::CharacteristicNotFound(
                "signature"
            )))
        );
    }

    #[test]
    fn test_connect_failure_surfaces() {
        let (mut scanner, _host) = scanner();
        let id = PeripheralId::new("phone");
        let (tx, mut rx) = oneshot::channel();
        scanner.connect_and_read_key(id.clone(), tx);
        scanner.handle_event(CentralEvent::ConnectFailed {
            id,
            reason: "timeout".into(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::Protocol(ProtocolError::ConnectFailed(
                "timeout".into()
            )))
        );
    }

    #[test]
    fn test_read_failure_and_bad_utf8() {
        let (mut scanner, _host) = scanner();
        let (id, mut rx) = connect_to_reading(&mut scanner);
        scanner.handle_event(CentralEvent::ValueUpdated {
            id: id.clone(),
            characteristic: SIGNATURE_UUID,
            value: Err("not permitted".into()),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(BleError::Protocol(ProtocolError::ReadFailed(_)))
        ));

        let (mut scanner, _host) = self::scanner();
        let (id, mut rx) = connect_to_reading(&mut scanner);
        scanner.handle_event(CentralEvent::ValueUpdated {
            id,
            characteristic: MESSAGE_UUID,
            value: Ok(vec![0xc3, 0x28]),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(BleError::Protocol(ProtocolError::Decode(_)))
        ));
    }

    #[test]
    fn test_unexpected_disconnect_fails() {
        let (mut scanner, _host) = scanner();
        let (id, mut rx) = connect_to_reading(&mut scanner);
        scanner.handle_event(value(&id, PUBLIC_KEY_UUID, "02ab"));
        scanner.handle_event(CentralEvent::Disconnected {
            id: id.clone(),
            reason: Some("link loss".into()),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::Protocol(ProtocolError::UnexpectedDisconnect))
        );

        // Partial fields from the dead connection never leak into the next one.
        let (id2, mut rx2) = connect_to_reading(&mut scanner);
        assert_eq!(id, id2);
        scanner.handle_event(value(&id2, SIGNATURE_UUID, "3045"));
        scanner.handle_event(value(&id2, MESSAGE_UUID, "hello"));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_safe_in_any_state() {
        let (mut scanner, _host) = scanner();
        scanner.disconnect();
        assert_eq!(scanner.state(), ScannerState::Idle);

        let (id, mut rx) = connect_to_reading(&mut scanner);
        scanner.disconnect();
        assert_eq!(rx.try_recv().unwrap(), Err(BleError::Cancelled));
        scanner.disconnect();

        // The in-flight read lands after cancellation and is dropped.
        scanner.handle_event(value(&id, PUBLIC_KEY_UUID, "02ab"));
        assert_eq!(scanner.state(), ScannerState::Idle);
    }

    #[test]
    fn test_second_connect_is_busy() {
        let (mut scanner, _host) = scanner();
        let (_id, mut rx) = connect_to_reading(&mut scanner);
        let (tx2, mut rx2) = oneshot::channel();
        scanner.connect_and_read_key(PeripheralId::new("other"), tx2);

        assert_eq!(rx2.try_recv().unwrap(), Err(BleError::Busy));
        assert!(rx.try_recv().is_err());
        assert_eq!(scanner.state(), ScannerState::Reading);
    }

    #[test]
    fn test_connect_stops_scanning() {
        let (mut scanner, host) = scanner();
        let (tx, _rx) = mpsc::unbounded_channel();
        scanner.scan_for_keys(tx).unwrap();
        scanner.handle_event(CentralEvent::Discovered(device("phone", -50)));

        let (reply, _key_rx) = oneshot::channel();
        scanner.connect_and_read_key(PeripheralId::new("phone"), reply);
        assert_eq!(
            host.calls(),
            vec![
                CentralCall::StartScan(vec![KEY_SERVICE_UUID]),
                CentralCall::StopScan,
                CentralCall::Connect(PeripheralId::new("phone")),
            ]
        );
    }

    #[test]
    fn test_connect_deferred_until_powered_on() {
        let host = MockCentral::default();
        let mut scanner = KeyScanner::new(Box::new(host.clone()));
        let id = PeripheralId::new("phone");
        let (tx, mut rx) = oneshot::channel();

        scanner.connect_and_read_key(id.clone(), tx);
        assert!(rx.try_recv().is_err());
        assert_eq!(scanner.state(), ScannerState::Connecting);
        assert!(host.calls().is_empty());

        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(host.calls(), vec![CentralCall::Connect(id.clone())]);

        // A repeated power report does not connect twice.
        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
        assert_eq!(host.count(|c| *c == CentralCall::Connect(id.clone())), 1);
    }

    #[test]
    fn test_deferred_connect_fails_when_adapter_turns_off() {
        let host = MockCentral::default();
        let mut scanner = KeyScanner::new(Box::new(host.clone()));
        let (tx, mut rx) = oneshot::channel();
        scanner.connect_and_read_key(PeripheralId::new("phone"), tx);

        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::AdapterUnavailable(AdapterState::PoweredOff))
        );
        assert!(host.calls().is_empty());
        assert_eq!(scanner.state(), ScannerState::Idle);
    }

    #[test]
    fn test_connect_fails_when_adapter_off() {
        let host = MockCentral::default();
        let mut scanner = KeyScanner::new(Box::new(host.clone()));
        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::Unauthorized));
        let (tx, mut rx) = oneshot::channel();
        scanner.connect_and_read_key(PeripheralId::new("phone"), tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::AdapterUnavailable(AdapterState::Unauthorized))
        );
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_failed_connect_leaves_nothing_to_tear_down() {
        let (mut scanner, host) = scanner();
        for peer in ["a", "b", "c"] {
            let (tx, _rx) = oneshot::channel();
            let id = PeripheralId::new(peer);
            scanner.connect_and_read_key(id.clone(), tx);
            scanner.handle_event(CentralEvent::ConnectFailed {
                id,
                reason: "le-connection-abort-by-local".into(),
            });
        }

        assert_eq!(host.count(|c| matches!(c, CentralCall::Disconnect(_))), 0);
        assert!(scanner.closing.is_empty());
        assert_eq!(scanner.state(), ScannerState::Idle);
    }

    #[test]
    fn test_cancel_tears_down_and_swallows_disconnect() {
        let (mut scanner, host) = scanner();
        let (id, _rx) = connect_to_reading(&mut scanner);
        scanner.disconnect();
        assert_eq!(host.count(|c| *c == CentralCall::Disconnect(id.clone())), 1);
        assert!(scanner.closing.contains(&id));

        scanner.handle_event(CentralEvent::Disconnected {
            id: id.clone(),
            reason: None,
        });
        assert!(scanner.closing.is_empty());
    }

    #[test]
    fn test_adapter_loss_fails_session() {
        let (mut scanner, _host) = scanner();
        let (_id, mut rx) = connect_to_reading(&mut scanner);
        scanner.handle_event(CentralEvent::AdapterStateChanged(AdapterState::PoweredOff));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BleError::AdapterUnavailable(AdapterState::PoweredOff))
        );
    }
}
