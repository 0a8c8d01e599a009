use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BridgeError, Result},
    profile::{WriteMode, CCC_ENABLE_INDICATE, CCC_ENABLE_NOTIFY},
    transport::{
        CharacteristicHandle, ControllerState, EventSender, ServiceHandle, ServiceState,
        Transport, TransportEvent,
    },
    types::{ConnectionParams, DeviceCandidate},
};

const CCC_DISABLE: [u8; 2] = [0x00, 0x00];

/// What a client configuration payload asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subscription {
    Enable,
    Disable,
}

fn subscription_for(payload: &[u8]) -> Result<Subscription> {
    if payload == CCC_ENABLE_NOTIFY || payload == CCC_ENABLE_INDICATE {
        Ok(Subscription::Enable)
    } else if payload == CCC_DISABLE {
        Ok(Subscription::Disable)
    } else {
        Err(BridgeError::InvalidParameters(format!(
            "Unknown client configuration payload {payload:02X?}"
        )))
    }
}

const fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::WithResponse => WriteType::WithResponse,
        WriteMode::WithoutResponse => WriteType::WithoutResponse,
    }
}

fn handle_for(characteristic: &Characteristic) -> CharacteristicHandle {
    CharacteristicHandle {
        uuid: characteristic.uuid,
        service: characteristic.service_uuid,
        notify: characteristic.properties.contains(CharPropFlags::NOTIFY),
        indicate: characteristic.properties.contains(CharPropFlags::INDICATE),
    }
}

struct Link {
    peripheral: Peripheral,
    events: EventSender,
    tasks: Vec<JoinHandle<()>>,
}

/// [`Transport`] over the platform Bluetooth stack
pub struct BleTransport {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    link: Mutex<Option<Link>>,
}

impl BleTransport {
    /// Create a transport on the platform Bluetooth manager
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            link: Mutex::new(None),
        })
    }

    async fn central(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BridgeError::DeviceNotFound)
    }

    async fn peripheral(&self) -> Result<Peripheral> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.peripheral.clone())
            .ok_or(BridgeError::Disconnected)
    }

    async fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral()
            .await?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BridgeError::CharacteristicNotFound { uuid })
    }

    async fn emit(&self, event: TransportEvent) {
        if let Some(link) = self.link.lock().await.as_ref() {
            let _ = link.events.send(event);
        }
    }
}

/// Forward notifications of `peripheral` as transport events
fn spawn_notification_forwarder(
    mut notifications: std::pin::Pin<
        Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = notifications.next().await {
            let event = TransportEvent::CharacteristicChanged {
                characteristic: data.uuid,
                value: Bytes::from(data.value),
                received_at: Instant::now(),
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Watch the adapter for the loss of `peripheral`
fn spawn_disconnect_watcher(
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    peripheral: Peripheral,
    events: EventSender,
) -> JoinHandle<()> {
    let id = peripheral.id();
    tokio::spawn(async move {
        while let Some(event) = central_events.next().await {
            if let CentralEvent::DeviceDisconnected(lost) = event {
                if lost == id {
                    let _ = events.send(TransportEvent::ControllerStateChanged(
                        ControllerState::Disconnected,
                    ));
                    break;
                }
            }
        }
    })
}

#[async_trait]
impl Transport for BleTransport {
    async fn scan(
        &self,
        prefixes: &[String],
        params: &ConnectionParams,
    ) -> Result<Vec<DeviceCandidate>> {
        let central = self.central().await?;

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Some(name) = properties.local_name else {
                continue;
            };
            let candidate = DeviceCandidate::new(
                name,
                properties.address.to_string(),
                properties.rssi.unwrap_or(i16::MIN),
            );
            if !prefixes.iter().any(|p| candidate.matches_prefix(p)) {
                continue;
            }

            debug!("Candidate {} at {}", candidate.name, candidate.address);
            self.peripherals
                .lock()
                .await
                .insert(candidate.address.clone(), peripheral);
            candidates.push(candidate);
        }

        info!("Scan completed. Found {} device(s)", candidates.len());
        Ok(candidates)
    }

    async fn connect(
        &self,
        candidate: &DeviceCandidate,
        params: &ConnectionParams,
        events: EventSender,
    ) -> Result<()> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&candidate.address)
            .cloned()
            .ok_or(BridgeError::DeviceNotFound)?;

        timeout(Duration::from_millis(params.timeout_ms), peripheral.connect())
            .await
            .map_err(|_| BridgeError::Timeout {
                timeout_ms: params.timeout_ms,
            })?
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

        let central = self.central().await?;
        let tasks = vec![
            spawn_notification_forwarder(peripheral.notifications().await?, events.clone()),
            spawn_disconnect_watcher(central.events().await?, peripheral.clone(), events.clone()),
        ];

        let _ = events.send(TransportEvent::ControllerStateChanged(
            ControllerState::Connected,
        ));
        let previous = self.link.lock().await.replace(Link {
            peripheral,
            events,
            tasks,
        });
        if let Some(previous) = previous {
            previous.tasks.iter().for_each(JoinHandle::abort);
        }

        info!("Connected to {}", candidate.name);
        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        self.emit(TransportEvent::ServiceStateChanged(ServiceState::Discovering))
            .await;
        self.peripheral().await?.discover_services().await?;
        self.emit(TransportEvent::ServiceStateChanged(ServiceState::Discovered))
            .await;
        Ok(())
    }

    async fn create_service_object(&self, uuid: Uuid) -> Result<Option<ServiceHandle>> {
        Ok(self
            .peripheral()
            .await?
            .services()
            .iter()
            .find(|s| s.uuid == uuid)
            .map(|s| ServiceHandle { uuid: s.uuid }))
    }

    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
    ) -> Result<Vec<CharacteristicHandle>> {
        Ok(self
            .peripheral()
            .await?
            .services()
            .iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics.iter().map(handle_for))
            .collect())
    }

    async fn characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Option<CharacteristicHandle> {
        self.discover_characteristics(service)
            .await
            .ok()?
            .into_iter()
            .find(|c| c.uuid == uuid)
    }

    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let target = self.find_characteristic(characteristic.uuid).await?;
        self.peripheral()
            .await?
            .write(&target, data, write_type(mode))
            .await
            .map_err(|e| BridgeError::Protocol(format!("Failed to send command: {e}")))?;

        if mode == WriteMode::WithResponse {
            self.emit(TransportEvent::CharacteristicWritten {
                characteristic: characteristic.uuid,
                value: Bytes::copy_from_slice(data),
            })
            .await;
        }
        Ok(())
    }

    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()> {
        let target = self.find_characteristic(characteristic.uuid).await?;
        let peripheral = self.peripheral().await?;
        // the stack picks notify or indicate from the declared properties
        match subscription_for(data)? {
            Subscription::Enable => peripheral.subscribe(&target).await?,
            Subscription::Disable => peripheral.unsubscribe(&target).await?,
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        link.tasks.iter().for_each(JoinHandle::abort);
        if link.peripheral.is_connected().await.unwrap_or(false) {
            link.peripheral.disconnect().await?;
        } else {
            warn!("Peripheral already disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::bluetooth_uuid;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_subscription_payloads() {
        assert_eq!(assert_ok!(subscription_for(&[0x01, 0x00])), Subscription::Enable);
        assert_eq!(assert_ok!(subscription_for(&[0x02, 0x00])), Subscription::Enable);
        assert_eq!(assert_ok!(subscription_for(&[0x00, 0x00])), Subscription::Disable);
        assert_err!(subscription_for(&[0x03]));
    }

    #[test]
    fn test_write_type_mapping() {
        assert_eq!(write_type(WriteMode::WithResponse), WriteType::WithResponse);
        assert_eq!(
            write_type(WriteMode::WithoutResponse),
            WriteType::WithoutResponse
        );
    }

    #[test]
    fn test_characteristic_properties() {
        let characteristic = Characteristic {
            uuid: bluetooth_uuid(0x2AD9),
            service_uuid: bluetooth_uuid(0x1826),
            properties: CharPropFlags::WRITE | CharPropFlags::INDICATE,
            descriptors: std::collections::BTreeSet::new(),
        };
        let handle = handle_for(&characteristic);
        assert!(handle.indicate);
        assert!(!handle.notify);
        assert_eq!(handle.service, bluetooth_uuid(0x1826));
    }
}
