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

//! BlueZ central used by the Current Time Service client.

use async_trait::async_trait;
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport};
use futures::{pin_mut, StreamExt};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::ble_constants::advertising;
use super::client::{Central, DeviceHandle, Link};
use crate::error::CtsError;

/// Poll interval while waiting for BlueZ to finish service discovery.
const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

/// Central backed by the default BlueZ adapter.
pub struct BluezCentral {
    adapter: Adapter,
    scan_task: Option<JoinHandle<()>>,
    adv_handle: Option<AdvertisementHandle>,
}

impl BluezCentral {
    /// Open the default adapter and power it on.
    pub async fn new() -> Result<Self, CtsError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            adapter,
            scan_task: None,
            adv_handle: None,
        })
    }

    /// Set the device name.
    pub async fn set_name(&self, name: &str) -> Result<(), CtsError> {
        self.adapter.set_alias(name.to_string()).await?;
        info!("Bluetooth name set to: {}", name);
        Ok(())
    }
}

#[async_trait]
impl Central for BluezCentral {
    type Link = BluezLink;

    async fn start_scan(&mut self, service: Uuid) -> Result<mpsc::Receiver<DeviceHandle>, CtsError> {
        let filter = DiscoveryFilter {
            uuids: [service].into_iter().collect(),
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        self.adapter.set_discovery_filter(filter).await?;

        let (tx, rx) = mpsc::channel(32);
        let adapter = self.adapter.clone();
        self.scan_task = Some(tokio::spawn(async move {
            // Property changes are reported as repeated `DeviceAdded` events.
            let events = match adapter.discover_devices_with_changes().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Discovery failed to start: {}", e);
                    return;
                }
            };
            pin_mut!(events);

            let mut reported = HashMap::new();
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(addr) = event else {
                    continue;
                };
                match describe(&adapter, addr).await {
                    Ok(Some(handle)) => {
                        if reported.get(&addr) == Some(&handle) {
                            continue;
                        }
                        reported.insert(addr, handle.clone());
                        if tx.send(handle).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => debug!("{} not heard in this scan", addr),
                    Err(e) => debug!("Skipping {}: {}", addr, e),
                }
            }
        }));
        Ok(rx)
    }

    async fn stop_scan(&mut self) -> Result<(), CtsError> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceHandle) -> Result<BluezLink, CtsError> {
        let failed = |reason: String| CtsError::ConnectionFailed {
            device: device.to_string(),
            reason,
        };

        let addr = device
            .address
            .parse::<Address>()
            .map_err(|e| failed(e.to_string()))?;
        let remote = self.adapter.device(addr).map_err(|e| failed(e.to_string()))?;
        remote.connect().await.map_err(|e| failed(e.to_string()))?;

        Ok(BluezLink { device: remote })
    }

    async fn advertise_self(&mut self, name: &str) -> Result<(), CtsError> {
        let adv = Advertisement {
            discoverable: Some(true),
            local_name: Some(name.to_string()),
            min_interval: Some(advertising::INTERVAL),
            max_interval: Some(advertising::INTERVAL),
            ..Default::default()
        };
        self.adv_handle = Some(self.adapter.advertise(adv).await?);
        Ok(())
    }
}

impl Drop for BluezCentral {
    fn drop(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}

async fn describe(adapter: &Adapter, addr: Address) -> bluer::Result<Option<DeviceHandle>> {
    let device = adapter.device(addr)?;
    let rssi = device.rssi().await?;
    let name = device.name().await?;
    let services = device.uuids().await?.unwrap_or_default();

    Ok(live_handle(addr, name, rssi, services))
}

/// BlueZ replays cached devices at discovery start. Only devices with an
/// RSSI were actually received during this scan.
fn live_handle(
    addr: Address,
    name: Option<String>,
    rssi: Option<i16>,
    services: HashSet<Uuid>,
) -> Option<DeviceHandle> {
    if rssi.is_none() {
        return None;
    }
    Some(DeviceHandle {
        address: addr.to_string(),
        name,
        services: services.into_iter().collect(),
    })
}

/// Connection to a remote device through BlueZ.
pub struct BluezLink {
    device: Device,
}

impl BluezLink {
    async fn wait_services_resolved(&self) -> Result<(), CtsError> {
        while !self.device.is_services_resolved().await? {
            if !self.device.is_connected().await? {
                return Err(CtsError::ConnectionLost(
                    "disconnected during service discovery".into(),
                ));
            }
            tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Link for BluezLink {
    type ServiceEndpoint = Service;
    type CharacteristicEndpoint = Characteristic;

    async fn service(&self, uuid: Uuid) -> Result<Option<Service>, CtsError> {
        self.wait_services_resolved().await?;
        for service in self.device.services().await? {
            if service.uuid().await? == uuid {
                return Ok(Some(service));
            }
        }
        Ok(None)
    }

    async fn characteristic(
        &self,
        service: &Service,
        uuid: Uuid,
    ) -> Result<Option<Characteristic>, CtsError> {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(Some(characteristic));
            }
        }
        Ok(None)
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>, CtsError> {
        characteristic
            .read()
            .await
            .map_err(|e| CtsError::ConnectionLost(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), CtsError> {
        Ok(self.device.disconnect().await?)
    }
}
