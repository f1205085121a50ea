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

//! Current Time Service peripheral.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use cts_link::bluetooth::{BluezPeripheral, CtsServer, ServerEvent};
use cts_link::config::Config;
use cts_link::{logging, Clock, SystemClock};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("cts_link=info,cts_server=info");

    info!("Starting CTS server v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (event_tx, event_rx) = mpsc::channel::<ServerEvent>(32);
    let peripheral = BluezPeripheral::new(event_tx, clock.clone(), &config.server).await?;
    info!("Adapter address: {}", peripheral.address().await?);

    let server = CtsServer::new(peripheral, clock);
    let mut task = tokio::spawn(server.run(event_rx));

    tokio::select! {
        result = &mut task => {
            match result? {
                Ok(()) => info!("Server stopped"),
                Err(e) => {
                    error!("Server failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            task.abort();
        }
    }

    info!("CTS server stopped");
    Ok(())
}
