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

//! Current Time Service peripheral state machine.
//!
//! The machine is transport-independent: it drives a [`Peripheral`] for
//! registration and advertising, and consumes [`ServerEvent`]s from a channel.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{CTS_SERVICE_UUID, CURRENT_TIME_UUID};
use super::events::ServerEvent;
use crate::codec::{Clock, TIME_VALUE_LEN};
use crate::error::CtsError;

/// Access flags of a local characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// The GATT service the server exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub properties: CharacteristicProperties,
    /// Attach a Client Characteristic Configuration descriptor (0x2902).
    pub notify_descriptor: bool,
    pub initial_value: [u8; TIME_VALUE_LEN],
}

impl ServiceDefinition {
    /// Current Time Service with one read/write/notify characteristic seeded with zeros.
    pub fn current_time() -> Self {
        Self {
            service: CTS_SERVICE_UUID,
            characteristic: CURRENT_TIME_UUID,
            properties: CharacteristicProperties {
                read: true,
                write: true,
                notify: true,
            },
            notify_descriptor: true,
            initial_value: [0; TIME_VALUE_LEN],
        }
    }
}

/// Peripheral-side operations of the Bluetooth stack.
#[async_trait]
pub trait Peripheral: Send {
    /// Register the service. Read and write requests must be forwarded as [`ServerEvent`]s.
    async fn register_service(&mut self, definition: &ServiceDefinition) -> Result<(), CtsError>;

    /// Begin advertising the registered service.
    async fn start_advertising(&mut self) -> Result<(), CtsError>;

    /// Stop advertising.
    async fn stop_advertising(&mut self) -> Result<(), CtsError>;
}

/// Current value of the Current Time characteristic.
#[derive(Debug, Clone)]
pub struct CharacteristicValue(Arc<RwLock<[u8; TIME_VALUE_LEN]>>);

impl CharacteristicValue {
    pub fn new(initial: [u8; TIME_VALUE_LEN]) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    pub fn get(&self) -> [u8; TIME_VALUE_LEN] {
        *self.0.read()
    }

    fn set(&self, value: [u8; TIME_VALUE_LEN]) {
        *self.0.write() = value;
    }
}

/// Decides which link-layer connection is the Current Time central.
///
/// The adapter may hold unrelated links (keyboards, headsets, outbound
/// connections, anything connected before the service was registered).
/// A device becomes the central only when it accesses the characteristic,
/// and only the central's link going down counts as a disconnect.
#[derive(Debug, Default)]
pub struct PeerTracker {
    links: HashSet<String>,
    central: Option<String>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device's link came up. Never promotes it on its own.
    pub fn link_up(&mut self, peer: &str) {
        self.links.insert(peer.to_string());
    }

    /// A device's link went down. Repeated reports for the same link are
    /// ignored.
    pub fn link_down(&mut self, peer: &str) -> Option<ServerEvent> {
        if !self.links.remove(peer) {
            return None;
        }
        if self.central.as_deref() == Some(peer) {
            self.central = None;
            return Some(ServerEvent::Disconnected {
                peer: peer.to_string(),
            });
        }
        None
    }

    /// `peer` read or wrote the characteristic.
    pub fn gatt_access(&mut self, peer: &str) -> Option<ServerEvent> {
        self.links.insert(peer.to_string());
        if self.central.is_some() {
            return None;
        }
        self.central = Some(peer.to_string());
        Some(ServerEvent::Connected {
            peer: peer.to_string(),
        })
    }

    pub fn central(&self) -> Option<&str> {
        self.central.as_deref()
    }
}

/// Lifecycle of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Service not registered yet, or advertising could not be restarted.
    Idle,
    /// Discoverable, waiting for a central.
    Advertising,
    /// A central is attached and advertising is stopped.
    Connected,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Idle => "Idle",
            ServerState::Advertising => "Advertising",
            ServerState::Connected => "Connected",
        }
    }
}

/// Current Time Service server.
pub struct CtsServer<P> {
    peripheral: P,
    clock: Arc<dyn Clock>,
    definition: ServiceDefinition,
    value: CharacteristicValue,
    state: ServerState,
    peer: Option<String>,
}

impl<P: Peripheral> CtsServer<P> {
    /// Create a new server.
    pub fn new(peripheral: P, clock: Arc<dyn Clock>) -> Self {
        let definition = ServiceDefinition::current_time();
        let value = CharacteristicValue::new(definition.initial_value);
        Self {
            peripheral,
            clock,
            definition,
            value,
            state: ServerState::Idle,
            peer: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Connected central, if any.
    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Handle to the characteristic value as the transport sees it.
    pub fn value(&self) -> CharacteristicValue {
        self.value.clone()
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    /// Register the service and start advertising.
    pub async fn start(&mut self) -> Result<(), CtsError> {
        self.peripheral.register_service(&self.definition).await?;
        info!(
            "Current Time Service registered (service {}, characteristic {})",
            self.definition.service, self.definition.characteristic
        );

        self.peripheral.start_advertising().await?;
        self.state = ServerState::Advertising;
        info!("Advertising {}", self.definition.service);
        Ok(())
    }

    /// Apply one event.
    pub async fn handle_event(&mut self, event: ServerEvent) -> Result<(), CtsError> {
        debug!("Server event {} in state {}", event.as_str(), self.state.as_str());

        match event {
            ServerEvent::Connected { peer } => self.on_connect(peer).await,
            ServerEvent::Disconnected { peer } => self.on_disconnect(peer).await,
            ServerEvent::CharacteristicRead { reply } => {
                let value = self.on_read();
                if reply.send(value.to_vec()).is_err() {
                    warn!("Read request dropped before the value was ready");
                }
                Ok(())
            }
            ServerEvent::CharacteristicWrite { value } => {
                info!("Characteristic write ignored: {:02x?}", value);
                Ok(())
            }
        }
    }

    /// Start, then process events until the channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<ServerEvent>) -> Result<(), CtsError> {
        self.start().await?;

        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                error!("Server event failed: {}", e);
            }
        }

        info!("Server event channel closed");
        Ok(())
    }

    async fn on_connect(&mut self, peer: String) -> Result<(), CtsError> {
        match self.state {
            ServerState::Connected => {
                debug!("Already connected, ignoring connect from {}", peer);
                Ok(())
            }
            ServerState::Advertising => {
                info!("Central connected: {}", peer);
                self.state = ServerState::Connected;
                self.peer = Some(peer);
                self.peripheral.stop_advertising().await?;
                info!("Advertising stopped");
                Ok(())
            }
            ServerState::Idle => {
                info!("Central connected while not advertising: {}", peer);
                self.state = ServerState::Connected;
                self.peer = Some(peer);
                Ok(())
            }
        }
    }

    async fn on_disconnect(&mut self, peer: String) -> Result<(), CtsError> {
        if self.state != ServerState::Connected {
            debug!("Not connected, ignoring disconnect from {}", peer);
            return Ok(());
        }
        if self.peer.as_deref() != Some(peer.as_str()) {
            debug!("Disconnect from unrelated device {}", peer);
            return Ok(());
        }

        info!("Central disconnected: {}", peer);
        self.peer = None;
        self.state = ServerState::Idle;
        self.peripheral.start_advertising().await?;
        self.state = ServerState::Advertising;
        info!("Advertising resumed");
        Ok(())
    }

    fn on_read(&mut self) -> [u8; TIME_VALUE_LEN] {
        let sample = self.clock.sample();
        let encoded = sample.encode();
        self.value.set(encoded);
        debug!("Read served: {} (fraction {}/256)", sample, sample.fraction256);
        encoded
    }
}
