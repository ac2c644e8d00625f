//! Bluetooth LE transport built on btleplug.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    BDAddr, Central as _, Characteristic, Peripheral as _, ScanFilter, ValueNotification,
    WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::{FutureExt as _, Stream, StreamExt as _};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::error::SessionError;
use crate::session::{Connector, DeviceSession};
use crate::state::{CommandName, DeviceRef, RawDeviceState};

const WRITE_CHARACTERISTIC: u16 = 0xFF01;
const NOTIFY_CHARACTERISTIC: u16 = 0xFF02;

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

pub struct BtleConnector<C> {
    adapter: Adapter,
    codec: Arc<C>,
}

impl<C: FrameCodec + 'static> BtleConnector<C> {
    /// Starts a background scan on the adapter so peripherals stay visible.
    pub async fn start(adapter: Adapter, codec: C) -> Result<Self, SessionError> {
        adapter.start_scan(ScanFilter::default()).await?;
        Ok(BtleConnector {
            adapter,
            codec: Arc::new(codec),
        })
    }

    async fn find_peripheral(&self, device: &DeviceRef) -> Result<Option<Peripheral>, SessionError> {
        let target = BDAddr::from(device.address.bytes());
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address() == target {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

fn find_characteristic(peripheral: &Peripheral, short_uuid: u16) -> Result<Characteristic, SessionError> {
    let uuid = uuid_from_u16(short_uuid);
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| SessionError::FieldMissing(format!("characteristic {uuid}")))
}

#[async_trait]
impl<C: FrameCodec + 'static> Connector for BtleConnector<C> {
    async fn locate(&self, device: &DeviceRef) -> Result<bool, SessionError> {
        Ok(self.find_peripheral(device).await?.is_some())
    }

    async fn connect(&self, device: &DeviceRef) -> Result<Box<dyn DeviceSession>, SessionError> {
        let peripheral = self
            .find_peripheral(device)
            .await?
            .ok_or_else(|| SessionError::NotFound(device.to_string()))?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        let opened = open_session(&peripheral).await;
        let (write, notify, notifications) =
            disconnect_on_error(opened, device, || peripheral.disconnect()).await?;

        info!("Connected to {}", device);
        Ok(Box::new(GattSession {
            peripheral,
            write,
            notify,
            notifications,
            codec: Arc::clone(&self.codec),
            state: None,
        }))
    }
}

/// Runs `disconnect` when `result` is an error, then hands `result` back.
async fn disconnect_on_error<T, D, F, E>(
    result: Result<T, SessionError>,
    device: &DeviceRef,
    disconnect: D,
) -> Result<T, SessionError>
where
    D: FnOnce() -> F,
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    if result.is_err() {
        if let Err(err) = disconnect().await {
            warn!("Disconnecting {} failed: {}", device, err);
        }
    }
    result
}

async fn open_session(
    peripheral: &Peripheral,
) -> Result<(Characteristic, Characteristic, Notifications), SessionError> {
    peripheral.discover_services().await?;
    let write = find_characteristic(peripheral, WRITE_CHARACTERISTIC)?;
    let notify = find_characteristic(peripheral, NOTIFY_CHARACTERISTIC)?;
    peripheral.subscribe(&notify).await?;
    let notifications = peripheral.notifications().await?;
    Ok((write, notify, notifications))
}

/// Drops notifications already queued, so the next report read answers the
/// request about to be written. Returns how many were dropped.
fn discard_queued<S>(notifications: &mut S) -> usize
where
    S: Stream<Item = ValueNotification> + Unpin,
{
    let mut dropped = 0;
    while let Some(Some(_)) = notifications.next().now_or_never() {
        dropped += 1;
    }
    dropped
}

/// Waits for the next notification from `report_uuid` and decodes it.
async fn read_report<S, C>(
    notifications: &mut S,
    report_uuid: Uuid,
    codec: &C,
) -> Result<RawDeviceState, SessionError>
where
    S: Stream<Item = ValueNotification> + Unpin,
    C: FrameCodec + ?Sized,
{
    while let Some(notification) = notifications.next().await {
        if notification.uuid != report_uuid {
            debug!("Ignoring notification from {}", notification.uuid);
            continue;
        }
        return codec.decode_report(&notification.value);
    }
    Err(SessionError::Link("notification stream closed".to_string()))
}

pub struct GattSession<C> {
    peripheral: Peripheral,
    write: Characteristic,
    notify: Characteristic,
    notifications: Notifications,
    codec: Arc<C>,
    state: Option<RawDeviceState>,
}

#[async_trait]
impl<C: FrameCodec + 'static> DeviceSession for GattSession<C> {
    async fn send_command(&mut self, command: CommandName) -> Result<(), SessionError> {
        if command == CommandName::GetReportCfg {
            let dropped = discard_queued(&mut self.notifications);
            if dropped > 0 {
                debug!("Dropped {} stale notifications", dropped);
            }
        }

        let frame = self.codec.encode(command);
        self.peripheral
            .write(&self.write, &frame, WriteType::WithResponse)
            .await?;

        if command == CommandName::GetReportCfg {
            let report =
                read_report(&mut self.notifications, self.notify.uuid, &*self.codec).await?;
            self.state = Some(report);
        }
        Ok(())
    }

    fn current_state(&self) -> Option<RawDeviceState> {
        self.state.clone()
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.unsubscribe(&self.notify).await?;
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
