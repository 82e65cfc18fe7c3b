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

//! Planet Nine BLE command line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use planetnine_ble::bluetooth::bluez::{self, BluezCentral};
use planetnine_ble::bluetooth::codec;
use planetnine_ble::bluetooth::gatt_server::GattServer;
use planetnine_ble::bluetooth::{CentralHost, IdleCentral, TokioReconnectTimer};
use planetnine_ble::engine::Hosts;
use planetnine_ble::events::LoggingSpellHandler;
use planetnine_ble::identity::{LocalIdentity, NoSigner};
use planetnine_ble::storage::{FileStore, KeyValueStore, KnownWandsIndex};
use planetnine_ble::trust::HttpTrustService;
use planetnine_ble::{Config, Engine, EngineHandle, WandCoordinator};

const WAND_REPORT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "planetnine-ble", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Advertise a key payload until interrupted
    Share {
        /// JSON file with pubKey, signature and message
        #[arg(long)]
        payload: PathBuf,
    },
    /// Scan for a nearby advertiser and read its key
    Receive {
        #[arg(long, default_value_t = 5)]
        scan_secs: u64,
    },
    /// Connect to wands and register them until interrupted
    Wands,
    /// List wands registered by this installation
    Known,
    /// Forget a registered wand so it is registered again
    Forget { public_key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("planetnine_ble=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Share { payload } => share(&config, payload).await,
        Command::Receive { scan_secs } => receive(&config, Duration::from_secs(scan_secs)).await,
        Command::Wands => wands(&config).await,
        Command::Known => {
            let coordinator = open_coordinator(&config)?;
            for (public_key, registered_at) in coordinator.known_wands() {
                println!("{}  {}", public_key, registered_at.to_rfc3339());
            }
            Ok(())
        }
        Command::Forget { public_key } => {
            let coordinator = open_coordinator(&config)?;
            if coordinator.forget_wand(&public_key)? {
                println!("Forgot {}", public_key);
            } else {
                println!("{} was not registered", public_key);
            }
            Ok(())
        }
    }
}

fn open_coordinator(config: &Config) -> Result<Arc<WandCoordinator>> {
    let data_dir = config.data_dir()?;
    info!("Data directory: {}", data_dir.display());

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&data_dir)?);
    let identity = LocalIdentity::load_or_create(store.as_ref())?;
    let index = KnownWandsIndex::load(store)?;
    let trust = HttpTrustService::new(&config.trust_base_url, config.http_timeout())?;

    Ok(Arc::new(WandCoordinator::new(
        identity,
        Arc::new(NoSigner),
        Arc::new(trust),
        index,
    )))
}

/// Start the engine. Wand auto-connect only runs when `watch_wands` is set.
async fn start_engine(
    config: &Config,
    watch_wands: bool,
) -> Result<(EngineHandle, JoinHandle<()>)> {
    let coordinator = open_coordinator(config)?;
    let adapter = bluez::default_adapter()
        .await
        .context("No usable Bluetooth adapter")?;

    let (engine, handle) = Engine::new(
        config.wand_settings(),
        coordinator,
        Box::new(LoggingSpellHandler),
        |senders| Hosts {
            peripheral: Box::new(GattServer::new(
                adapter.clone(),
                &config.advertised_name,
                senders.peripheral,
            )),
            key_central: Box::new(BluezCentral::new(adapter.clone(), senders.key_central)),
            wand_central: if watch_wands {
                Box::new(BluezCentral::new(adapter, senders.wand_central)) as Box<dyn CentralHost>
            } else {
                Box::new(IdleCentral)
            },
            timer: Box::new(TokioReconnectTimer::new(senders.reconnect)),
        },
    );
    Ok((handle, tokio::spawn(engine.run())))
}

async fn stop_engine(handle: EngineHandle, task: JoinHandle<()>) -> Result<()> {
    handle.shutdown().await;
    task.await.context("Engine task failed")?;
    Ok(())
}

async fn share(config: &Config, path: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
    let payload = codec::decode(&bytes).with_context(|| format!("Invalid payload in {:?}", path))?;

    let (handle, task) = start_engine(config, false).await?;
    handle.start_advertising(payload).await?;
    info!("Sharing key as '{}', press Ctrl+C to stop", config.advertised_name);

    tokio::signal::ctrl_c().await?;
    handle.stop_advertising().await;
    stop_engine(handle, task).await
}

async fn receive(config: &Config, scan_for: Duration) -> Result<()> {
    let (handle, task) = start_engine(config, false).await?;
    let mut lists = handle.scan_for_keys().await?;

    let mut latest = Vec::new();
    let deadline = tokio::time::sleep(scan_for);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            list = lists.recv() => match list {
                Some(list) => latest = list,
                None => break,
            },
        }
    }
    handle.stop_scanning().await;

    let Some(device) = latest.first() else {
        stop_engine(handle, task).await?;
        bail!("No key advertisers found");
    };
    info!(
        "Reading key from {} ({} dBm)",
        device.display_name.as_deref().unwrap_or(device.id.as_str()),
        device.rssi
    );

    let result = handle.connect_and_read_key(device.id.clone()).await;
    stop_engine(handle, task).await?;
    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn wands(config: &Config) -> Result<()> {
    let (handle, task) = start_engine(config, true).await?;
    info!("Watching for wands, press Ctrl+C to stop");

    let mut report = tokio::time::interval(WAND_REPORT_INTERVAL);
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to wait for Ctrl+C: {}", e);
                }
                break;
            }
            _ = report.tick() => {
                for wand in handle.wands().await {
                    info!(
                        "{} [{}] {:?} rssi={} key={}",
                        wand.name,
                        wand.id,
                        wand.connection_state,
                        wand.rssi,
                        if wand.public_key.is_empty() { "-" } else { wand.public_key.as_str() }
                    );
                }
            }
        }
    }

    stop_engine(handle, task).await
}
