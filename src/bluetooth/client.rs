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

//! Current Time Service central state machine.
//!
//! Scan for a peripheral advertising the Current Time Service, connect to the
//! first match, resolve the service and characteristic, then read the time
//! on a fixed period.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::{client, CTS_SERVICE_UUID, CURRENT_TIME_UUID};
use crate::codec::TimeSample;
use crate::error::CtsError;

/// A peer seen in an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Stack-specific address, e.g. `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: BTreeSet<Uuid>,
}

impl DeviceHandle {
    pub fn advertises_service(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid)
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Central-side operations of the Bluetooth stack.
#[async_trait]
pub trait Central: Send {
    type Link: Link;

    /// Start scanning. Every observed advertisement is delivered on the returned
    /// channel. `service` is a hint for stacks that can filter in hardware.
    async fn start_scan(&mut self, service: Uuid) -> Result<mpsc::Receiver<DeviceHandle>, CtsError>;

    /// Stop scanning. No further advertisements are delivered afterwards.
    async fn stop_scan(&mut self) -> Result<(), CtsError>;

    /// Connect once to `device`.
    async fn connect(&mut self, device: &DeviceHandle) -> Result<Self::Link, CtsError>;

    /// Advertise this central under `name`. Not required by the protocol.
    async fn advertise_self(&mut self, _name: &str) -> Result<(), CtsError> {
        Ok(())
    }
}

/// An established connection to a peripheral.
#[async_trait]
pub trait Link: Send + Sync {
    type ServiceEndpoint: Send + Sync;
    type CharacteristicEndpoint: Send + Sync;

    /// Find a primary service by UUID.
    async fn service(&self, uuid: Uuid) -> Result<Option<Self::ServiceEndpoint>, CtsError>;

    /// Find a characteristic by UUID within `service`.
    async fn characteristic(
        &self,
        service: &Self::ServiceEndpoint,
        uuid: Uuid,
    ) -> Result<Option<Self::CharacteristicEndpoint>, CtsError>;

    /// Read the raw value of `characteristic`.
    async fn read(&self, characteristic: &Self::CharacteristicEndpoint) -> Result<Vec<u8>, CtsError>;

    async fn disconnect(&self) -> Result<(), CtsError>;
}

/// Consumer of decoded samples.
pub trait SampleSink: Send {
    fn consume(&mut self, sample: TimeSample);
}

/// Writes each sample as an info record.
#[derive(Debug, Default)]
pub struct LogSink;

impl SampleSink for LogSink {
    fn consume(&mut self, sample: TimeSample) {
        info!("{}", sample);
    }
}

impl SampleSink for Vec<TimeSample> {
    fn consume(&mut self, sample: TimeSample) {
        self.push(sample);
    }
}

/// Progress of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Advertising,
    Scanning,
    DeviceFound,
    Connecting,
    Connected,
    Discovering,
    Ready,
    ReadLoop,
    /// Scan ended without a match.
    NotFound,
    /// Connect, discovery, or the read loop failed.
    Failed,
}

impl ClientState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientState::Idle => "Idle",
            ClientState::Advertising => "Advertising",
            ClientState::Scanning => "Scanning",
            ClientState::DeviceFound => "DeviceFound",
            ClientState::Connecting => "Connecting",
            ClientState::Connected => "Connected",
            ClientState::Discovering => "Discovering",
            ClientState::Ready => "Ready",
            ClientState::ReadLoop => "ReadLoop",
            ClientState::NotFound => "NotFound",
            ClientState::Failed => "Failed",
        }
    }
}

/// Tunables for one client run.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub scan_timeout: Duration,
    pub read_period: Duration,
    /// Stop after this many read cycles. `None` reads until the link drops.
    pub max_reads: Option<u64>,
    /// Advertise this device under the given name before scanning.
    pub self_advertise: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            service: CTS_SERVICE_UUID,
            characteristic: CURRENT_TIME_UUID,
            scan_timeout: client::DEFAULT_SCAN_TIMEOUT,
            read_period: client::READ_PERIOD,
            max_reads: None,
            self_advertise: None,
        }
    }
}

/// Resolved remote service and characteristic for one connection.
pub struct Endpoints<L: Link> {
    pub service: L::ServiceEndpoint,
    pub characteristic: L::CharacteristicEndpoint,
}

/// Result of one wait during scanning.
enum ScanStep {
    Matched(DeviceHandle),
    Ignored(DeviceHandle),
    Deadline,
    Ended,
    Cancelled,
}

/// Current Time Service client.
pub struct CtsClient<C> {
    central: C,
    options: ClientOptions,
    state: ClientState,
    stop: watch::Receiver<bool>,
}

impl<C: Central> CtsClient<C> {
    /// Create a new client. Setting `stop` to `true` cancels a scan in
    /// progress and ends the read loop.
    pub fn new(central: C, options: ClientOptions, stop: watch::Receiver<bool>) -> Self {
        Self {
            central,
            options,
            state: ClientState::Idle,
            stop,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn central(&self) -> &C {
        &self.central
    }

    fn set_state(&mut self, state: ClientState) {
        debug!("Client state {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
    }

    /// Scan until a device advertising the target service appears, the
    /// deadline passes, or a stop is requested.
    pub async fn scan(&mut self) -> Result<DeviceHandle, CtsError> {
        self.set_state(ClientState::Scanning);
        let target = self.options.service;
        let deadline = Instant::now() + self.options.scan_timeout;
        let mut adverts = self.central.start_scan(target).await?;
        info!("Scanning for {} ({}s)", target, self.options.scan_timeout.as_secs());

        loop {
            let step = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => ScanStep::Cancelled,
                next = tokio::time::timeout_at(deadline, adverts.recv()) => match next {
                    Err(_) => ScanStep::Deadline,
                    Ok(None) => ScanStep::Ended,
                    Ok(Some(device)) if device.advertises_service(&target) => ScanStep::Matched(device),
                    Ok(Some(device)) => ScanStep::Ignored(device),
                },
            };

            match step {
                ScanStep::Ignored(device) => {
                    debug!("Advertisement from {} ignored", device);
                }
                ScanStep::Matched(device) => {
                    // Stop before looking at anything else so a second
                    // advertisement cannot produce another connect.
                    drop(adverts);
                    self.end_scan().await;
                    info!("Device found: {}", device);
                    self.set_state(ClientState::DeviceFound);
                    return Ok(device);
                }
                ScanStep::Cancelled => {
                    drop(adverts);
                    self.end_scan().await;
                    info!("Scan cancelled");
                    self.set_state(ClientState::NotFound);
                    return Err(CtsError::Cancelled);
                }
                ScanStep::Deadline | ScanStep::Ended => {
                    drop(adverts);
                    self.end_scan().await;
                    warn!("No device advertising {} found", target);
                    self.set_state(ClientState::NotFound);
                    return Err(CtsError::DeviceNotFound {
                        service: target,
                        timeout_secs: self.options.scan_timeout.as_secs(),
                    });
                }
            }
        }
    }

    /// A failed stop leaves discovery running in the stack but does not
    /// change the scan outcome.
    async fn end_scan(&mut self) {
        if let Err(e) = self.central.stop_scan().await {
            warn!("Failed to stop scanning: {}", e);
        }
    }

    /// Connect to `device`. There is no retry.
    pub async fn connect(&mut self, device: DeviceHandle) -> Result<C::Link, CtsError> {
        self.set_state(ClientState::Connecting);
        info!("Connecting to {}", device);

        match self.central.connect(&device).await {
            Ok(link) => {
                info!("Connected to {}", device);
                self.set_state(ClientState::Connected);
                Ok(link)
            }
            Err(e) => {
                self.set_state(ClientState::Failed);
                Err(match e {
                    CtsError::ConnectionFailed { .. } => e,
                    other => CtsError::ConnectionFailed {
                        device: device.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Resolve the Current Time service and characteristic on `link`.
    pub async fn discover(&mut self, link: &C::Link) -> Result<Endpoints<C::Link>, CtsError> {
        self.set_state(ClientState::Discovering);

        let resolved = self.resolve(link).await;
        match resolved {
            Ok(endpoints) => {
                info!(
                    "Resolved service {} and characteristic {}",
                    self.options.service, self.options.characteristic
                );
                self.set_state(ClientState::Ready);
                Ok(endpoints)
            }
            Err(e) => {
                self.set_state(ClientState::Failed);
                Err(e)
            }
        }
    }

    async fn resolve(&self, link: &C::Link) -> Result<Endpoints<C::Link>, CtsError> {
        let service = link
            .service(self.options.service)
            .await?
            .ok_or(CtsError::ServiceNotFound(self.options.service))?;
        let characteristic = link
            .characteristic(&service, self.options.characteristic)
            .await?
            .ok_or(CtsError::CharacteristicNotFound(self.options.characteristic))?;
        Ok(Endpoints {
            service,
            characteristic,
        })
    }

    /// Read and decode the characteristic once.
    pub async fn read_sample(
        &self,
        link: &C::Link,
        endpoints: &Endpoints<C::Link>,
    ) -> Result<TimeSample, CtsError> {
        let data = link
            .read(&endpoints.characteristic)
            .await
            .map_err(|e| match e {
                CtsError::ConnectionLost(_) => e,
                other => CtsError::ConnectionLost(other.to_string()),
            })?;
        TimeSample::decode(&data)
    }

    /// Sleep one period, read, decode, and hand the sample to `sink`; repeat.
    ///
    /// Malformed values are dropped and the loop continues. A failed read
    /// ends the loop with [`CtsError::ConnectionLost`]. Returns the number of
    /// completed cycles when `max_reads` is reached or a stop is requested.
    pub async fn read_loop<S: SampleSink>(
        &mut self,
        link: &C::Link,
        endpoints: &Endpoints<C::Link>,
        sink: &mut S,
    ) -> Result<u64, CtsError> {
        self.set_state(ClientState::ReadLoop);
        let mut cycles = 0u64;

        loop {
            if self.options.max_reads.is_some_and(|max| cycles >= max) {
                info!("Read limit reached after {} cycles", cycles);
                return Ok(cycles);
            }

            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => {
                    info!("Read loop stopped after {} cycles", cycles);
                    return Ok(cycles);
                }
                _ = tokio::time::sleep(self.options.read_period) => {}
            }

            cycles += 1;
            match self.read_sample(link, endpoints).await {
                Ok(sample) => sink.consume(sample),
                Err(e) if e.is_recoverable() => {
                    warn!("Discarding time value: {}", e);
                }
                Err(e) => {
                    error!("Read failed: {}", e);
                    self.set_state(ClientState::Failed);
                    return Err(e);
                }
            }
        }
    }

    /// Run the full sequence: optional self-advertising, scan, connect,
    /// discover, and read until the loop ends.
    pub async fn run<S: SampleSink>(&mut self, sink: &mut S) -> Result<u64, CtsError> {
        if let Some(name) = self.options.self_advertise.clone() {
            self.set_state(ClientState::Advertising);
            self.central.advertise_self(&name).await?;
            info!("Advertising as '{}'", name);
        }

        let device = self.scan().await?;
        let link = self.connect(device).await?;

        let outcome = match self.discover(&link).await {
            Ok(endpoints) => self.read_loop(&link, &endpoints, sink).await,
            Err(e) => Err(e),
        };

        if let Err(e) = link.disconnect().await {
            debug!("Disconnect after run: {}", e);
        }
        outcome
    }
}

/// Resolves once `true` is published on `stop`. Never resolves if the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    fn device(address: &str, services: &[Uuid]) -> DeviceHandle {
        DeviceHandle {
            address: address.to_string(),
            name: None,
            services: services.iter().copied().collect(),
        }
    }

    /// Scripted central: replays advertisements and read results.
    #[derive(Default)]
    struct ScriptedCentral {
        scan_tx: Option<mpsc::Sender<DeviceHandle>>,
        adverts: Vec<DeviceHandle>,
        scan_stops: usize,
        fail_stop: bool,
        connects: Vec<DeviceHandle>,
        fail_connect: bool,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
        reads: Arc<Mutex<VecDeque<Result<Vec<u8>, CtsError>>>>,
        advertised_as: Option<String>,
    }

    struct ScriptedLink {
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
        reads: Arc<Mutex<VecDeque<Result<Vec<u8>, CtsError>>>>,
    }

    #[async_trait]
    impl Central for ScriptedCentral {
        type Link = ScriptedLink;

        async fn start_scan(&mut self, _service: Uuid) -> Result<mpsc::Receiver<DeviceHandle>, CtsError> {
            let (tx, rx) = mpsc::channel(16);
            for advert in self.adverts.drain(..) {
                tx.send(advert).await.map_err(|e| CtsError::Transport(e.to_string()))?;
            }
            // Held open so an exhausted script waits for the deadline.
            self.scan_tx = Some(tx);
            Ok(rx)
        }

        async fn stop_scan(&mut self) -> Result<(), CtsError> {
            self.scan_tx = None;
            self.scan_stops += 1;
            if self.fail_stop {
                return Err(CtsError::Transport("org.bluez.Error.Failed".into()));
            }
            Ok(())
        }

        async fn connect(&mut self, device: &DeviceHandle) -> Result<ScriptedLink, CtsError> {
            self.connects.push(device.clone());
            if self.fail_connect {
                return Err(CtsError::Transport("page timeout".into()));
            }
            Ok(ScriptedLink {
                services: self.services.clone(),
                characteristics: self.characteristics.clone(),
                reads: self.reads.clone(),
            })
        }

        async fn advertise_self(&mut self, name: &str) -> Result<(), CtsError> {
            self.advertised_as = Some(name.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl Link for ScriptedLink {
        type ServiceEndpoint = Uuid;
        type CharacteristicEndpoint = Uuid;

        async fn service(&self, uuid: Uuid) -> Result<Option<Uuid>, CtsError> {
            Ok(self.services.contains(&uuid).then_some(uuid))
        }

        async fn characteristic(&self, _service: &Uuid, uuid: Uuid) -> Result<Option<Uuid>, CtsError> {
            Ok(self.characteristics.contains(&uuid).then_some(uuid))
        }

        async fn read(&self, _characteristic: &Uuid) -> Result<Vec<u8>, CtsError> {
            self.reads
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(CtsError::Transport("not connected".into())))
        }

        async fn disconnect(&self) -> Result<(), CtsError> {
            Ok(())
        }
    }

    fn cts_central() -> ScriptedCentral {
        ScriptedCentral {
            services: vec![CTS_SERVICE_UUID],
            characteristics: vec![CURRENT_TIME_UUID],
            ..Default::default()
        }
    }

    fn new_client(central: ScriptedCentral) -> (CtsClient<ScriptedCentral>, watch::Sender<bool>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (CtsClient::new(central, ClientOptions::default(), stop_rx), stop_tx)
    }

    const VALUE: [u8; 10] = [0xE8, 0x07, 6, 15, 13, 45, 30, 6, 128, 0];

    #[tokio::test(start_paused = true)]
    async fn test_scan_filters_by_service() {
        let battery = crate::bluetooth::ble_constants::uuid16(0x180F);
        let mut central = cts_central();
        central.adverts = vec![
            device("11:11:11:11:11:11", &[]),
            device("22:22:22:22:22:22", &[battery]),
            device("33:33:33:33:33:33", &[battery, CTS_SERVICE_UUID]),
            device("44:44:44:44:44:44", &[CTS_SERVICE_UUID]),
        ];
        let (mut client, _stop) = new_client(central);

        let found = client.scan().await.unwrap();
        assert_eq!(found.address, "33:33:33:33:33:33");
        assert_eq!(client.state(), ClientState::DeviceFound);
        assert_eq!(client.central().scan_stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_keeps_match_when_stop_fails() {
        let mut central = cts_central();
        central.fail_stop = true;
        central.adverts = vec![device("44:44:44:44:44:44", &[CTS_SERVICE_UUID])];
        let (mut client, _stop) = new_client(central);

        let found = client.scan().await.unwrap();
        assert_eq!(found.address, "44:44:44:44:44:44");
        assert_eq!(client.state(), ClientState::DeviceFound);
        assert_eq!(client.central().scan_stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_times_out() {
        let mut central = cts_central();
        central.adverts = vec![device("11:11:11:11:11:11", &[])];
        let (mut client, _stop) = new_client(central);

        let err = client.scan().await.unwrap_err();
        assert!(matches!(err, CtsError::DeviceNotFound { timeout_secs: 60, .. }));
        assert_eq!(client.state(), ClientState::NotFound);
        assert_eq!(client.central().scan_stops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_cancelled() {
        let (mut client, stop) = new_client(cts_central());
        stop.send(true).unwrap();

        let err = client.scan().await.unwrap_err();
        assert!(matches!(err, CtsError::Cancelled));
        assert_eq!(client.state(), ClientState::NotFound);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let mut central = cts_central();
        central.fail_connect = true;
        let (mut client, _stop) = new_client(central);

        let err = client
            .connect(device("33:33:33:33:33:33", &[CTS_SERVICE_UUID]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CtsError::ConnectionFailed { .. }));
        assert_eq!(client.state(), ClientState::Failed);
        assert_eq!(client.central().connects.len(), 1);
    }

    #[tokio::test]
    async fn test_discover_missing_service() {
        let mut central = cts_central();
        central.services.clear();
        let (mut client, _stop) = new_client(central);

        let link = client.connect(device("aa", &[CTS_SERVICE_UUID])).await.unwrap();
        let err = client.discover(&link).await.err().unwrap();
        assert!(matches!(err, CtsError::ServiceNotFound(uuid) if uuid == CTS_SERVICE_UUID));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[tokio::test]
    async fn test_discover_missing_characteristic() {
        let mut central = cts_central();
        central.characteristics.clear();
        let (mut client, _stop) = new_client(central);

        let link = client.connect(device("aa", &[CTS_SERVICE_UUID])).await.unwrap();
        let err = client.discover(&link).await.err().unwrap();
        assert!(matches!(err, CtsError::CharacteristicNotFound(uuid) if uuid == CURRENT_TIME_UUID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_skips_malformed_and_ends_on_loss() {
        let central = cts_central();
        {
            let mut reads = central.reads.lock();
            reads.push_back(Ok(VALUE.to_vec()));
            reads.push_back(Ok(VALUE[..8].to_vec()));
            reads.push_back(Ok(VALUE[..9].to_vec()));
        }
        let (mut client, _stop) = new_client(central);

        let link = client.connect(device("aa", &[CTS_SERVICE_UUID])).await.unwrap();
        let endpoints = client.discover(&link).await.unwrap();
        let mut samples: Vec<TimeSample> = Vec::new();
        let err = client
            .read_loop(&link, &endpoints, &mut samples)
            .await
            .unwrap_err();

        assert!(matches!(err, CtsError::ConnectionLost(_)));
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].year, 2024);
        assert_eq!(samples[0], samples[1]);
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_waits_one_period() {
        let central = cts_central();
        central.reads.lock().push_back(Ok(VALUE.to_vec()));
        let (stop_tx, stop_rx) = watch::channel(false);
        let options = ClientOptions {
            max_reads: Some(1),
            ..Default::default()
        };
        let mut client = CtsClient::new(central, options, stop_rx);

        let link = client.connect(device("aa", &[CTS_SERVICE_UUID])).await.unwrap();
        let endpoints = client.discover(&link).await.unwrap();
        let started = Instant::now();
        let mut samples: Vec<TimeSample> = Vec::new();
        let cycles = client.read_loop(&link, &endpoints, &mut samples).await.unwrap();

        assert_eq!(cycles, 1);
        assert!(started.elapsed() >= ClientOptions::default().read_period);
        assert_eq!(samples.len(), 1);
        drop(stop_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_self_advertising() {
        let mut central = cts_central();
        central.adverts = vec![device("33:33:33:33:33:33", &[CTS_SERVICE_UUID])];
        central.reads.lock().push_back(Ok(VALUE.to_vec()));
        central.reads.lock().push_back(Ok(VALUE.to_vec()));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let options = ClientOptions {
            max_reads: Some(2),
            self_advertise: Some("CTS Client".into()),
            ..Default::default()
        };
        let mut client = CtsClient::new(central, options, stop_rx);

        let mut samples: Vec<TimeSample> = Vec::new();
        assert_eq!(client.run(&mut samples).await.unwrap(), 2);
        assert_eq!(samples.len(), 2);
        assert_eq!(client.central().advertised_as.as_deref(), Some("CTS Client"));
        assert_eq!(client.state(), ClientState::ReadLoop);
    }
}
