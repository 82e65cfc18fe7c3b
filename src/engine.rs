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

//! The engine task.
//!
//! One task owns the advertiser, the key scanner and wand discovery. Host
//! events, reconnect timers and application requests are all handled here in
//! arrival order, so the state machines never need locks of their own.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::bluetooth::advertiser::AdvertiseReply;
use crate::bluetooth::command::CommandEnvelope;
use crate::bluetooth::scanner::{DeviceListSender, KeyReply};
use crate::bluetooth::{
    Advertiser, CentralEvent, CentralHost, DiscoveredDevice, KeyPayload, KeyScanner,
    PeripheralEvent, PeripheralHost, PeripheralId, ReconnectTicket, ReconnectTimer, SharedWand,
    WandDiscovery, WandEvent, WandRecord, WandSettings,
};
use crate::coordinator::WandCoordinator;
use crate::error::BleError;
use crate::events::{EventProcessor, SpellHandler};

const REQUEST_QUEUE: usize = 32;

/// Senders the host bindings report into.
#[derive(Debug, Clone)]
pub struct EventSenders {
    pub peripheral: mpsc::UnboundedSender<PeripheralEvent>,
    pub key_central: mpsc::UnboundedSender<CentralEvent>,
    pub wand_central: mpsc::UnboundedSender<CentralEvent>,
    pub reconnect: mpsc::UnboundedSender<ReconnectTicket>,
}

/// Platform bindings for every role.
pub struct Hosts {
    pub peripheral: Box<dyn PeripheralHost>,
    pub key_central: Box<dyn CentralHost>,
    pub wand_central: Box<dyn CentralHost>,
    pub timer: Box<dyn ReconnectTimer>,
}

enum EngineRequest {
    StartAdvertising {
        payload: KeyPayload,
        reply: AdvertiseReply,
    },
    StopAdvertising,
    ScanForKeys {
        devices: DeviceListSender,
        reply: oneshot::Sender<Result<(), BleError>>,
    },
    StopScanning,
    ConnectAndReadKey {
        id: PeripheralId,
        reply: KeyReply,
    },
    Disconnect,
    Wands {
        reply: oneshot::Sender<Vec<WandRecord>>,
    },
    Wand {
        id: PeripheralId,
        reply: oneshot::Sender<Option<SharedWand>>,
    },
    SendCommand {
        id: PeripheralId,
        envelope: CommandEnvelope,
        reply: oneshot::Sender<bool>,
    },
    DisconnectWand {
        id: PeripheralId,
    },
    ForgetWand {
        public_key: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Shutdown,
}

pub struct Engine {
    advertiser: Advertiser,
    scanner: KeyScanner,
    wands: WandDiscovery,
    processor: EventProcessor,
    coordinator: Arc<WandCoordinator>,
    requests: mpsc::Receiver<EngineRequest>,
    peripheral_rx: mpsc::UnboundedReceiver<PeripheralEvent>,
    key_rx: mpsc::UnboundedReceiver<CentralEvent>,
    wand_rx: mpsc::UnboundedReceiver<CentralEvent>,
    reconnect_rx: mpsc::UnboundedReceiver<ReconnectTicket>,
    wand_events: mpsc::UnboundedReceiver<WandEvent>,
}

impl Engine {
    /// Build the engine. `make_hosts` receives the senders the bindings must
    /// report into.
    pub fn new<F>(
        settings: WandSettings,
        coordinator: Arc<WandCoordinator>,
        spells: Box<dyn SpellHandler>,
        make_hosts: F,
    ) -> (Self, EngineHandle)
    where
        F: FnOnce(EventSenders) -> Hosts,
    {
        let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let (wand_tx, wand_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (wand_event_tx, wand_events) = mpsc::unbounded_channel();
        let (request_tx, requests) = mpsc::channel(REQUEST_QUEUE);

        let hosts = make_hosts(EventSenders {
            peripheral: peripheral_tx,
            key_central: key_tx,
            wand_central: wand_tx,
            reconnect: reconnect_tx,
        });

        let engine = Self {
            advertiser: Advertiser::new(hosts.peripheral),
            scanner: KeyScanner::new(hosts.key_central),
            wands: WandDiscovery::new(hosts.wand_central, hosts.timer, wand_event_tx, settings),
            processor: EventProcessor::new(coordinator.clone(), spells),
            coordinator: coordinator.clone(),
            requests,
            peripheral_rx,
            key_rx,
            wand_rx,
            reconnect_rx,
            wand_events,
        };
        let handle = EngineHandle {
            requests: request_tx,
            coordinator,
        };
        (engine, handle)
    }

    /// Run until shut down or every handle is dropped.
    pub async fn run(mut self) {
        info!("Engine started");
        loop {
            // Host events are drained before requests so a request always sees
            // the effect of every event that arrived before it.
            tokio::select! {
                biased;

                Some(event) = self.peripheral_rx.recv() => self.advertiser.handle_event(event),
                Some(event) = self.key_rx.recv() => self.scanner.handle_event(event),
                Some(event) = self.wand_rx.recv() => self.wands.handle_event(event),
                Some(ticket) = self.reconnect_rx.recv() => self.wands.on_reconnect_due(ticket),
                Some(event) = self.wand_events.recv() => self.on_wand_event(event),
                request = self.requests.recv() => match request {
                    Some(EngineRequest::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
            }
        }

        self.advertiser.stop_advertising();
        self.scanner.stop_scanning();
        self.scanner.disconnect();
        self.wands.shutdown();
        info!("Engine stopped");
    }

    fn on_wand_event(&mut self, event: WandEvent) {
        if let Some((id, envelope)) = self.processor.process_event(event) {
            if !self.wands.send_command(&id, &envelope) {
                debug!("Reply to {} dropped: wand not connected", id);
            }
        }
    }

    fn handle_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::StartAdvertising { payload, reply } => {
                self.advertiser.start_advertising(payload, reply)
            }
            EngineRequest::StopAdvertising => self.advertiser.stop_advertising(),
            EngineRequest::ScanForKeys { devices, reply } => {
                let _ = reply.send(self.scanner.scan_for_keys(devices));
            }
            EngineRequest::StopScanning => self.scanner.stop_scanning(),
            EngineRequest::ConnectAndReadKey { id, reply } => {
                self.scanner.connect_and_read_key(id, reply)
            }
            EngineRequest::Disconnect => self.scanner.disconnect(),
            EngineRequest::Wands { reply } => {
                let _ = reply.send(self.wands.wands());
            }
            EngineRequest::Wand { id, reply } => {
                let _ = reply.send(self.wands.wand(&id));
            }
            EngineRequest::SendCommand {
                id,
                envelope,
                reply,
            } => {
                let _ = reply.send(self.wands.send_command(&id, &envelope));
            }
            EngineRequest::DisconnectWand { id } => self.wands.disconnect_wand(&id),
            EngineRequest::ForgetWand { public_key, reply } => {
                let forgotten = self.coordinator.forget_wand(&public_key);
                let removed = self.wands.forget_public_key(&public_key);
                let _ = reply.send(forgotten.map(|known| known || removed));
            }
            EngineRequest::Shutdown => {}
        }
    }
}

/// Cloneable front end of a running [`Engine`].
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<EngineRequest>,
    coordinator: Arc<WandCoordinator>,
}

impl EngineHandle {
    async fn send(&self, request: EngineRequest) -> bool {
        self.requests.send(request).await.is_ok()
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if !self.send(request(tx)).await {
            return None;
        }
        rx.await.ok()
    }

    pub fn coordinator(&self) -> &Arc<WandCoordinator> {
        &self.coordinator
    }

    /// Advertise `payload`. Resolves once advertising has started or failed.
    pub async fn start_advertising(&self, payload: KeyPayload) -> Result<(), BleError> {
        self.call(|reply| EngineRequest::StartAdvertising { payload, reply })
            .await
            .unwrap_or(Err(BleError::Cancelled))
    }

    pub async fn stop_advertising(&self) {
        self.send(EngineRequest::StopAdvertising).await;
    }

    /// Scan for key advertisers. Every change of the device list is delivered
    /// on the returned channel, strongest signal first.
    pub async fn scan_for_keys(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<Vec<DiscoveredDevice>>, BleError> {
        let (devices, list_rx) = mpsc::unbounded_channel();
        self.call(|reply| EngineRequest::ScanForKeys { devices, reply })
            .await
            .unwrap_or(Err(BleError::Cancelled))?;
        Ok(list_rx)
    }

    pub async fn stop_scanning(&self) {
        self.send(EngineRequest::StopScanning).await;
    }

    /// Connect to `id` and read its key payload.
    pub async fn connect_and_read_key(&self, id: PeripheralId) -> Result<KeyPayload, BleError> {
        self.call(|reply| EngineRequest::ConnectAndReadKey { id, reply })
            .await
            .unwrap_or(Err(BleError::Cancelled))
    }

    /// Cancel the active key read, if any.
    pub async fn disconnect(&self) {
        self.send(EngineRequest::Disconnect).await;
    }

    pub async fn wands(&self) -> Vec<WandRecord> {
        self.call(|reply| EngineRequest::Wands { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn wand(&self, id: PeripheralId) -> Option<SharedWand> {
        self.call(|reply| EngineRequest::Wand { id, reply })
            .await
            .flatten()
    }

    /// Write a command to a connected wand. False when it isn't connected.
    pub async fn send_command(&self, id: PeripheralId, envelope: CommandEnvelope) -> bool {
        self.call(|reply| EngineRequest::SendCommand {
            id,
            envelope,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn disconnect_wand(&self, id: PeripheralId) {
        self.send(EngineRequest::DisconnectWand { id }).await;
    }

    /// Forget a wand: it is dropped from the known index and the wand table and
    /// will be registered again the next time it is read.
    pub async fn forget_wand(&self, public_key: &str) -> Result<bool> {
        let public_key = public_key.to_string();
        self.call(|reply| EngineRequest::ForgetWand { public_key, reply })
            .await
            .ok_or_else(|| anyhow!("Engine is not running"))?
    }

    pub async fn shutdown(&self) {
        self.send(EngineRequest::Shutdown).await;
    }
}
