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

//! BLE service and characteristic UUIDs for the Current Time Service.

use std::time::Duration;
use uuid::Uuid;

/// Bluetooth SIG base UUID with the 16-bit slot zeroed.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expand a 16-bit SIG-assigned UUID into its 128-bit form.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Current Time Service, 16-bit form.
pub const CTS_SERVICE_UUID16: u16 = 0x1805;

/// Current Time characteristic, 16-bit form.
pub const CURRENT_TIME_UUID16: u16 = 0x2A2B;

/// Current Time Service UUID.
pub const CTS_SERVICE_UUID: Uuid = uuid16(CTS_SERVICE_UUID16);

/// Current Time characteristic UUID.
/// Properties: Read, Write, Notify
pub const CURRENT_TIME_UUID: Uuid = uuid16(CURRENT_TIME_UUID16);

/// Advertising timing.
pub mod advertising {
    use super::Duration;

    /// Advertising interval granularity (0.625 ms) in microseconds.
    pub const UNIT_MICROS: u64 = 625;

    /// Min and max advertising interval.
    pub const INTERVAL: Duration = Duration::from_millis(250);

    /// Convert a duration to controller interval units, rounding down.
    pub const fn to_units(interval: Duration) -> u64 {
        interval.as_micros() as u64 / UNIT_MICROS
    }
}

/// Client timing.
pub mod client {
    use super::Duration;

    /// Period between characteristic reads.
    pub const READ_PERIOD: Duration = Duration::from_millis(2222);

    /// Default bound on scanning.
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);
}
