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

//! Current Time Service central.

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use cts_link::bluetooth::{BluezCentral, CtsClient, LogSink};
use cts_link::config::Config;
use cts_link::{logging, CtsError};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("cts_link=info,cts_client=info");

    info!("Starting CTS client v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let central = BluezCentral::new().await?;
    central.set_name(&config.client.device_name).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });

    let mut client = CtsClient::new(central, config.client.options(), stop_rx);
    match client.run(&mut LogSink).await {
        Ok(reads) => {
            info!("CTS client stopped after {} reads", reads);
            Ok(())
        }
        Err(CtsError::Cancelled) => {
            info!("CTS client cancelled before a device was found");
            Ok(())
        }
        Err(e) => {
            error!("CTS client ended in state {}: {}", client.state().as_str(), e);
            Err(e.into())
        }
    }
}
