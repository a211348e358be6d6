//! BLE transport for the frame, on top of btleplug.
//!
//! The frame exposes one GATT service with three characteristics: commands
//! (write with response), responses (notify) and raw upload data (write with
//! response). Discovery and connection live here; everything above talks to
//! the [`Transport`] trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BleConfig;
use crate::error::{FrameError, Result};
use crate::session::{FrameSession, LinkEvent, Transport};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A frame seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFrame {
    pub id: String,
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// GATT writes against a connected frame.
pub struct BleTransport {
    peripheral: Peripheral,
    command: Characteristic,
    data: Characteristic,
}

#[async_trait]
impl Transport for BleTransport {
    async fn write_command(&self, frame: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.command, frame, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn write_chunk(&self, chunk: &[u8]) -> Result<()> {
        self.peripheral
            .write(&self.data, chunk, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}

impl BleTransport {
    pub async fn disconnect(&self) -> Result<()> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}

/// A connected frame: the session plus the link underneath it.
pub struct BleFrame {
    pub session: FrameSession,
    transport: Arc<BleTransport>,
    forwarder: JoinHandle<()>,
}

impl BleFrame {
    pub async fn disconnect(self) -> Result<()> {
        info!("disconnecting");
        let result = self.transport.disconnect().await;
        self.forwarder.abort();
        result
    }
}

async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| FrameError::transport("no Bluetooth adapter found"))
}

async fn describe(peripheral: &Peripheral) -> Result<DiscoveredFrame> {
    let props = peripheral.properties().await?;
    Ok(DiscoveredFrame {
        id: peripheral.id().to_string(),
        address: peripheral.address().to_string(),
        name: props.as_ref().and_then(|p| p.local_name.clone()),
        rssi: props.as_ref().and_then(|p| p.rssi),
    })
}

fn name_matches(found: &DiscoveredFrame, prefix: &str) -> bool {
    prefix.is_empty()
        || found
            .name
            .as_deref()
            .is_some_and(|name| name.starts_with(prefix))
}

/// Scans for `cfg.scan_secs` and returns frames whose name matches the prefix.
pub async fn scan(cfg: &BleConfig) -> Result<Vec<DiscoveredFrame>> {
    let adapter = default_adapter().await?;
    info!("scanning for {:?}", cfg.scan_duration());
    adapter.start_scan(ScanFilter::default()).await?;
    sleep(cfg.scan_duration()).await;

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let frame = describe(&peripheral).await?;
        if name_matches(&frame, &cfg.name_prefix) {
            debug!("found {:?} at {}", frame.name, frame.id);
            found.push(frame);
        }
    }
    if let Err(e) = adapter.stop_scan().await {
        warn!("stop_scan failed: {e}");
    }
    Ok(found)
}

/// Scans until a peripheral with this id or address shows up.
async fn find_peripheral(adapter: &Adapter, id: &str, within: Duration) -> Result<Peripheral> {
    adapter.start_scan(ScanFilter::default()).await?;
    let deadline = Instant::now() + within;
    let found = loop {
        let mut hit = None;
        for peripheral in adapter.peripherals().await? {
            let frame = describe(&peripheral).await?;
            if frame.id == id || frame.address.eq_ignore_ascii_case(id) {
                hit = Some(peripheral);
                break;
            }
        }
        if let Some(peripheral) = hit {
            break Ok(peripheral);
        }
        if Instant::now() >= deadline {
            break Err(FrameError::transport(format!("frame {id} not found")));
        }
        sleep(POLL_INTERVAL).await;
    };
    if let Err(e) = adapter.stop_scan().await {
        warn!("stop_scan failed: {e}");
    }
    found
}

fn characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| FrameError::transport(format!("characteristic {uuid} missing")))
}

/// Connects to the frame with the given id (or address) and returns a ready session.
pub async fn connect(id: &str, cfg: &BleConfig) -> Result<BleFrame> {
    let adapter = default_adapter().await?;
    let peripheral = find_peripheral(&adapter, id, cfg.scan_duration()).await?;

    info!("connecting to {id}");
    timeout(cfg.connect_timeout(), peripheral.connect())
        .await
        .map_err(|_| {
            FrameError::transport(format!("connect timed out after {:?}", cfg.connect_timeout()))
        })??;
    peripheral.discover_services().await?;

    if !peripheral.services().iter().any(|s| s.uuid == cfg.service_uuid) {
        warn!("service {} not advertised, trying characteristics anyway", cfg.service_uuid);
    }
    let command = characteristic(&peripheral, cfg.command_uuid)?;
    let response = characteristic(&peripheral, cfg.response_uuid)?;
    let data = characteristic(&peripheral, cfg.data_uuid)?;

    peripheral.subscribe(&response).await?;
    let mut notifications = peripheral.notifications().await?;
    let mut central_events = adapter.events().await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let peripheral_id = peripheral.id();
    let response_uuid = response.uuid;
    let forwarder = tokio::spawn(async move {
        loop {
            tokio::select! {
                note = notifications.next() => match note {
                    Some(note) if note.uuid == response_uuid => {
                        if tx.send(LinkEvent::Frame(note.value)).is_err() {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => {
                        debug!("notification stream ended");
                        let _ = tx.send(LinkEvent::Disconnected);
                        break;
                    }
                },
                event = central_events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(gone)) if gone == peripheral_id => {
                        let _ = tx.send(LinkEvent::Disconnected);
                        break;
                    }
                    Some(_) => {}
                    None => {
                        let _ = tx.send(LinkEvent::Disconnected);
                        break;
                    }
                },
            }
        }
    });

    let transport = Arc::new(BleTransport {
        peripheral,
        command,
        data,
    });
    info!("connected to {id}");
    Ok(BleFrame {
        session: FrameSession::new(transport.clone(), rx),
        transport,
        forwarder,
    })
}
