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

//! Events delivered to the server state machine.

use tokio::sync::oneshot;

/// Connection and characteristic-access events raised by the Bluetooth stack.
///
/// Stack callbacks only forward these into a channel; all state changes
/// happen in the single loop that owns [`super::CtsServer`].
#[derive(Debug)]
pub enum ServerEvent {
    /// A central connected.
    Connected { peer: String },
    /// The central disconnected.
    Disconnected { peer: String },
    /// A read of the Current Time characteristic is pending. The encoded
    /// value must be sent on `reply` before the stack answers the read.
    CharacteristicRead { reply: oneshot::Sender<Vec<u8>> },
    /// A central wrote to the Current Time characteristic.
    CharacteristicWrite { value: Vec<u8> },
}

impl ServerEvent {
    /// Short name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "CONNECTED",
            Self::Disconnected { .. } => "DISCONNECTED",
            Self::CharacteristicRead { .. } => "READ",
            Self::CharacteristicWrite { .. } => "WRITE",
        }
    }
}
