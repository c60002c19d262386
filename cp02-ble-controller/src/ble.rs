//! BLE link to a CP02 charger over btleplug
//!
//! [`BtleLink`] implements the engine's [`Link`]: it scans, connects, resolves
//! the TX/RX characteristics and forwards TX notifications (and the link
//! dropping) to the engine's event channel.

use std::collections::HashMap;
use std::time::Duration;

use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use cp02_node::{Advertisement, Error, Link, LinkEvent, Peer, Result};
use cp02_proto::ble::{RX_CHAR_UUID, SERVICE_UUID, TX_CHAR_UUID};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::try_parse(s).map_err(Error::transport)
}

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await.map_err(Error::transport)?;
    let adapters = manager.adapters().await.map_err(Error::transport)?;
    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::transport("no Bluetooth adapter found"))
}

struct Connected {
    peripheral: Peripheral,
    tx: Option<Characteristic>,
    rx: Option<Characteristic>,
    forwarder: Option<JoinHandle<()>>,
}

pub struct BtleLink {
    adapter: Adapter,
    service: Uuid,
    tx_uuid: Uuid,
    rx_uuid: Uuid,
    seen: HashMap<String, Peripheral>,
    connected: Option<Connected>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl BtleLink {
    /// Open the default adapter. Notifications and disconnects arrive on the
    /// returned receiver, which goes to [`cp02_node::Engine::new`].
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<LinkEvent>)> {
        let adapter = get_adapter().await?;
        let (events, receiver) = mpsc::unbounded_channel();
        let link = Self {
            adapter,
            service: parse_uuid(SERVICE_UUID)?,
            tx_uuid: parse_uuid(TX_CHAR_UUID)?,
            rx_uuid: parse_uuid(RX_CHAR_UUID)?,
            seen: HashMap::new(),
            connected: None,
            events,
        };
        Ok((link, receiver))
    }

    fn current(&self) -> Result<&Connected> {
        self.connected.as_ref().ok_or(Error::NotConnected)
    }

    async fn close(&mut self) -> Result<()> {
        let Some(connected) = self.connected.take() else {
            return Ok(());
        };
        if let Some(forwarder) = connected.forwarder {
            forwarder.abort();
        }
        connected.peripheral.disconnect().await.map_err(Error::transport)
    }
}

impl Link for BtleLink {
    async fn scan(&mut self, duration: Duration) -> Result<Vec<Advertisement>> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::transport)?;
        tokio::time::sleep(duration).await;
        let peripherals = self.adapter.peripherals().await.map_err(Error::transport)?;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("stop_scan: {e}");
        }

        self.seen.clear();
        let mut found = Vec::new();
        for peripheral in peripherals {
            let Some(props) = peripheral.properties().await.map_err(Error::transport)? else {
                continue;
            };
            let address = peripheral.address().to_string();
            found.push(Advertisement {
                address: address.clone(),
                name: props.local_name,
                rssi: props.rssi,
                has_service: props.services.contains(&self.service),
            });
            self.seen.insert(address, peripheral);
        }
        Ok(found)
    }

    async fn connect(&mut self, peer: &Peer) -> Result<()> {
        self.close().await.ok();
        let peripheral = self
            .seen
            .get(&peer.address)
            .cloned()
            .ok_or_else(|| Error::transport(format!("{} was not seen in the last scan", peer.address)))?;
        peripheral.connect().await.map_err(Error::transport)?;
        self.connected = Some(Connected { peripheral, tx: None, rx: None, forwarder: None });
        Ok(())
    }

    async fn discover(&mut self) -> Result<bool> {
        let (tx_uuid, rx_uuid) = (self.tx_uuid, self.rx_uuid);
        let connected = self.connected.as_mut().ok_or(Error::NotConnected)?;
        connected
            .peripheral
            .discover_services()
            .await
            .map_err(Error::transport)?;

        let characteristics = connected.peripheral.characteristics();
        connected.tx = characteristics.iter().find(|c| c.uuid == tx_uuid).cloned();
        connected.rx = characteristics.iter().find(|c| c.uuid == rx_uuid).cloned();
        Ok(connected.tx.is_some() && connected.rx.is_some())
    }

    async fn subscribe(&mut self) -> Result<()> {
        let connected = self.current()?;
        let peripheral = connected.peripheral.clone();
        let tx = connected.tx.clone().ok_or_else(|| Error::transport("TX characteristic not resolved"))?;

        peripheral.subscribe(&tx).await.map_err(Error::transport)?;
        let notifications = peripheral.notifications().await.map_err(Error::transport)?;
        let central_events = self.adapter.events().await.map_err(Error::transport)?;

        let forwarder = tokio::spawn(forward(
            peripheral.id(),
            tx.uuid,
            notifications,
            central_events,
            self.events.clone(),
        ));
        if let Some(connected) = self.connected.as_mut() {
            connected.forwarder = Some(forwarder);
        }
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let connected = self.current()?;
        let rx = connected.rx.as_ref().ok_or_else(|| Error::transport("RX characteristic not resolved"))?;
        let write_type = if rx.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        connected
            .peripheral
            .write(rx, frame, write_type)
            .await
            .map_err(Error::transport)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.close().await
    }
}

async fn forward(
    id: PeripheralId,
    tx_uuid: Uuid,
    mut notifications: std::pin::Pin<Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>>,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(n) if n.uuid == tx_uuid => {
                    if events.send(LinkEvent::Notification(n.value)).is_err() {
                        return;
                    }
                }
                Some(_) => {}
                None => break,
            },
            event = central_events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => break,
                Some(_) => {}
                None => break,
            },
        }
    }
    log::info!("charger link dropped");
    let _ = events.send(LinkEvent::Disconnected);
}
