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

//! Error taxonomy for the Current Time Service roles.

use thiserror::Error;
use uuid::Uuid;

/// Conditions surfaced by the client and server state machines.
#[derive(Debug, Error)]
pub enum CtsError {
    /// Scan deadline passed without a matching advertisement.
    #[error("no device advertising {service} found within {timeout_secs}s")]
    DeviceNotFound { service: Uuid, timeout_secs: u64 },

    /// Scan was stopped by an external request before a match.
    #[error("scan cancelled")]
    Cancelled,

    #[error("connection to {device} failed: {reason}")]
    ConnectionFailed { device: String, reason: String },

    #[error("service {0} not found on peer")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found on peer")]
    CharacteristicNotFound(Uuid),

    /// A read failed after the connection was established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("malformed time payload: {len} bytes")]
    MalformedPayload { len: usize },

    /// Fault reported by the Bluetooth stack outside the cases above.
    #[error("transport error: {0}")]
    Transport(String),
}

impl CtsError {
    /// Whether the current run can continue after this condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound { .. } | Self::MalformedPayload { .. }
        )
    }
}

impl From<bluer::Error> for CtsError {
    fn from(e: bluer::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_conditions() {
        assert!(CtsError::MalformedPayload { len: 3 }.is_recoverable());
        assert!(CtsError::DeviceNotFound {
            service: Uuid::nil(),
            timeout_secs: 60
        }
        .is_recoverable());
        assert!(!CtsError::ConnectionLost("gone".into()).is_recoverable());
        assert!(!CtsError::ServiceNotFound(Uuid::nil()).is_recoverable());
    }

    #[test]
    fn test_messages() {
        let e = CtsError::MalformedPayload { len: 8 };
        assert_eq!(e.to_string(), "malformed time payload: 8 bytes");
    }
}
