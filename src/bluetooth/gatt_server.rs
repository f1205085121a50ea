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

//! BlueZ GATT server backing the Current Time Service peripheral.

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{advertising, CTS_SERVICE_UUID};
use super::events::ServerEvent;
use super::server::{PeerTracker, Peripheral, ServiceDefinition};
use crate::codec::Clock;
use crate::config::ServerConfig;
use crate::error::CtsError;

/// Peripheral backed by the default BlueZ adapter.
pub struct BluezPeripheral {
    adapter: Adapter,
    local_name: String,
    notify_period: Duration,
    clock: Arc<dyn Clock>,
    event_tx: mpsc::Sender<ServerEvent>,
    service: Uuid,
    tracker: SharedTracker,
    adv_handle: Option<AdvertisementHandle>,
    app_handle: Option<ApplicationHandle>,
    watcher: Option<JoinHandle<()>>,
}

impl BluezPeripheral {
    /// Open the default adapter. Stack callbacks are forwarded to `event_tx`.
    pub async fn new(
        event_tx: mpsc::Sender<ServerEvent>,
        clock: Arc<dyn Clock>,
        config: &ServerConfig,
    ) -> Result<Self, CtsError> {
        info!("Initializing BLE GATT server...");

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        adapter.set_alias(config.device_name.clone()).await?;
        info!("Bluetooth name set to: {}", config.device_name);

        Ok(Self {
            adapter,
            local_name: config.device_name.clone(),
            notify_period: config.notify_period(),
            clock,
            event_tx,
            service: CTS_SERVICE_UUID,
            tracker: Arc::new(Mutex::new(PeerTracker::new())),
            adv_handle: None,
            app_handle: None,
            watcher: None,
        })
    }

    /// Get the adapter address.
    pub async fn address(&self) -> Result<Address, CtsError> {
        Ok(self.adapter.address().await?)
    }

    fn characteristic(&self, definition: &ServiceDefinition) -> Characteristic {
        let properties = definition.properties;

        let read_tx = self.event_tx.clone();
        let read_tracker = self.tracker.clone();
        let read = properties.read.then(|| CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let event_tx = read_tx.clone();
                let tracker = read_tracker.clone();
                Box::pin(async move {
                    debug!("Read request from {} at offset {}", req.device_address, req.offset);
                    promote(&tracker, &event_tx, req.device_address).await?;
                    let (reply, value_rx) = oneshot::channel();
                    event_tx
                        .send(ServerEvent::CharacteristicRead { reply })
                        .await
                        .map_err(|_| ReqError::Failed)?;
                    let value = value_rx.await.map_err(|_| ReqError::Failed)?;
                    let offset = (req.offset as usize).min(value.len());
                    Ok::<_, ReqError>(value[offset..].to_vec())
                })
            }),
            ..Default::default()
        });

        let write_tx = self.event_tx.clone();
        let write_tracker = self.tracker.clone();
        let write = properties.write.then(|| CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                    let event_tx = write_tx.clone();
                    let tracker = write_tracker.clone();
                    Box::pin(async move {
                        debug!("Write request from {}: {} bytes", req.device_address, value.len());
                        promote(&tracker, &event_tx, req.device_address).await?;
                        event_tx
                            .send(ServerEvent::CharacteristicWrite { value })
                            .await
                            .map_err(|_| ReqError::Failed)
                    })
                },
            )),
            ..Default::default()
        });

        // BlueZ attaches the 0x2902 descriptor to every notifying characteristic.
        let clock = self.clock.clone();
        let period = self.notify_period;
        let notify = properties.notify.then(|| CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let clock = clock.clone();
                Box::pin(async move {
                    info!("Notification session started");
                    let mut ticker = tokio::time::interval(period);
                    loop {
                        ticker.tick().await;
                        if notifier.is_stopped() {
                            break;
                        }
                        let value = clock.sample().encode().to_vec();
                        if let Err(e) = notifier.notify(value).await {
                            debug!("Notification failed: {}", e);
                            break;
                        }
                    }
                    info!("Notification session ended");
                })
            })),
            ..Default::default()
        });

        Characteristic {
            uuid: definition.characteristic,
            read,
            write,
            notify,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Peripheral for BluezPeripheral {
    async fn register_service(&mut self, definition: &ServiceDefinition) -> Result<(), CtsError> {
        if definition.notify_descriptor && !definition.properties.notify {
            warn!("Notify descriptor requested on a characteristic without notify");
        }

        let service = Service {
            uuid: definition.service,
            primary: true,
            characteristics: vec![self.characteristic(definition)],
            ..Default::default()
        };
        let app = Application {
            services: vec![service],
            ..Default::default()
        };

        self.app_handle = Some(self.adapter.serve_gatt_application(app).await?);
        self.service = definition.service;
        info!("GATT service registered");

        if self.watcher.is_none() {
            let adapter = self.adapter.clone();
            let tracker = self.tracker.clone();
            let event_tx = self.event_tx.clone();
            self.watcher = Some(tokio::spawn(watch_connections(adapter, tracker, event_tx)));
        }
        Ok(())
    }

    async fn start_advertising(&mut self) -> Result<(), CtsError> {
        if self.adv_handle.is_some() {
            debug!("Advertising already active");
            return Ok(());
        }

        let adv = Advertisement {
            service_uuids: vec![self.service].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(self.local_name.clone()),
            min_interval: Some(advertising::INTERVAL),
            max_interval: Some(advertising::INTERVAL),
            ..Default::default()
        };

        self.adv_handle = Some(self.adapter.advertise(adv).await?);
        debug!(
            "Advertising interval {} units",
            advertising::to_units(advertising::INTERVAL)
        );
        Ok(())
    }

    async fn stop_advertising(&mut self) -> Result<(), CtsError> {
        // Dropping the handle unregisters the advertisement.
        if self.adv_handle.take().is_none() {
            debug!("Advertising already stopped");
        }
        Ok(())
    }
}

impl Drop for BluezPeripheral {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

type SharedTracker = Arc<Mutex<PeerTracker>>;

/// Per-device watch tasks, aborted on removal and when the set is dropped.
#[derive(Default)]
struct DeviceWatches(HashMap<Address, JoinHandle<()>>);

impl DeviceWatches {
    fn watch(
        &mut self,
        adapter: &Adapter,
        addr: Address,
        tracker: &SharedTracker,
        event_tx: &mpsc::Sender<ServerEvent>,
    ) {
        if self.0.contains_key(&addr) {
            return;
        }
        let adapter = adapter.clone();
        let tracker = tracker.clone();
        let event_tx = event_tx.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = watch_device(adapter, addr, tracker, event_tx).await {
                debug!("Stopped watching {}: {}", addr, e);
            }
        });
        self.0.insert(addr, task);
    }

    fn unwatch(&mut self, addr: &Address) {
        if let Some(task) = self.0.remove(addr) {
            task.abort();
        }
    }
}

impl Drop for DeviceWatches {
    fn drop(&mut self) {
        for (_, task) in self.0.drain() {
            task.abort();
        }
    }
}

/// Track the `Connected` property of every known device.
async fn watch_connections(
    adapter: Adapter,
    tracker: SharedTracker,
    event_tx: mpsc::Sender<ServerEvent>,
) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("Cannot watch adapter events: {}", e);
            return;
        }
    };
    pin_mut!(events);

    let mut watches = DeviceWatches::default();
    match adapter.device_addresses().await {
        Ok(addresses) => {
            for addr in addresses {
                watches.watch(&adapter, addr, &tracker, &event_tx);
            }
        }
        Err(e) => warn!("Cannot list known devices: {}", e),
    }

    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceAdded(addr) => {
                watches.watch(&adapter, addr, &tracker, &event_tx);
            }
            AdapterEvent::DeviceRemoved(addr) => {
                watches.unwatch(&addr);
                let lost = tracker.lock().link_down(&addr.to_string());
                if let Some(event) = lost {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Feed link changes of one device into the tracker. Only the promoted
/// central's disconnect reaches the server.
async fn watch_device(
    adapter: Adapter,
    addr: Address,
    tracker: SharedTracker,
    event_tx: mpsc::Sender<ServerEvent>,
) -> bluer::Result<()> {
    let device = adapter.device(addr)?;
    let changes = device.events().await?;
    pin_mut!(changes);

    let peer = addr.to_string();
    if device.is_connected().await? {
        tracker.lock().link_up(&peer);
    }

    while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
        if let DeviceProperty::Connected(connected) = property {
            let event = if connected {
                tracker.lock().link_up(&peer);
                None
            } else {
                tracker.lock().link_down(&peer)
            };
            if let Some(event) = event {
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Promote `peer` to the central on its first characteristic access.
async fn promote(
    tracker: &SharedTracker,
    event_tx: &mpsc::Sender<ServerEvent>,
    peer: Address,
) -> Result<(), ReqError> {
    let connected = tracker.lock().gatt_access(&peer.to_string());
    if let Some(event) = connected {
        event_tx.send(event).await.map_err(|_| ReqError::Failed)?;
    }
    Ok(())
}
