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

//! Bluetooth Current Time Service roles.
//!
//! `server` and `client` hold the transport-independent state machines;
//! `gatt_server` and `central` bind them to BlueZ.

pub mod ble_constants;
mod central;
mod client;
mod events;
mod gatt_server;
mod server;

pub use central::{BluezCentral, BluezLink};
pub use client::{
    Central, ClientOptions, ClientState, CtsClient, DeviceHandle, Endpoints, Link, LogSink,
    SampleSink,
};
pub use events::ServerEvent;
pub use gatt_server::BluezPeripheral;
pub use server::{
    CharacteristicProperties, CharacteristicValue, CtsServer, PeerTracker, Peripheral,
    ServerState, ServiceDefinition,
};
