//! Wireless transport contract consumed by the session engine.
//!
//! The engine never talks to a radio stack directly. It drives a [`Transport`] and
//! receives asynchronous [`TransportEvent`]s on a channel handed over at connect time.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{sync::mpsc, time::Instant};
use uuid::Uuid;

use crate::{
    error::Result,
    profile::WriteMode,
    types::{ConnectionParams, DeviceCandidate},
};

/// A service object created on the connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Service UUID
    pub uuid: Uuid,
}

/// A resolved characteristic and the properties it declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Owning service UUID
    pub service: Uuid,
    /// Declares notify
    pub notify: bool,
    /// Declares indicate
    pub indicate: bool,
}

/// Link-level state reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Link established
    Connected,
    /// Link lost or closed
    Disconnected,
}

/// Service discovery progress reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Characteristic enumeration in progress
    Discovering,
    /// Characteristics enumerated
    Discovered,
}

/// Asynchronous event delivered by the transport into the session loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Notification or indication received
    CharacteristicChanged {
        /// Source characteristic
        characteristic: Uuid,
        /// Payload
        value: Bytes,
        /// Arrival time
        received_at: Instant,
    },
    /// A write request was confirmed by the device
    CharacteristicWritten {
        /// Target characteristic
        characteristic: Uuid,
        /// Bytes that were written
        value: Bytes,
    },
    /// Service discovery progressed
    ServiceStateChanged(ServiceState),
    /// Link state changed
    ControllerStateChanged(ControllerState),
    /// Service-level failure
    ServiceError(String),
    /// Controller-level failure
    ControllerError(String),
}

/// Sender half the transport pushes events into
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Short-range wireless transport
///
/// One transport instance drives at most one link at a time, so every session needs its
/// own instance; connecting a second session through it takes the link away from the first.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for devices whose advertised name starts with one of `prefixes`
    async fn scan(
        &self,
        prefixes: &[String],
        params: &ConnectionParams,
    ) -> Result<Vec<DeviceCandidate>>;

    /// Open a link to `candidate`; events for that link go to `events`
    async fn connect(
        &self,
        candidate: &DeviceCandidate,
        params: &ConnectionParams,
        events: EventSender,
    ) -> Result<()>;

    /// Discover the services of the connected device
    async fn discover_services(&self) -> Result<()>;

    /// Create the service object for `uuid`, `None` when the device lacks it
    async fn create_service_object(&self, uuid: Uuid) -> Result<Option<ServiceHandle>>;

    /// Enumerate the characteristics of a service
    async fn discover_characteristics(
        &self,
        service: &ServiceHandle,
    ) -> Result<Vec<CharacteristicHandle>>;

    /// Look up one characteristic of a discovered service
    async fn characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Option<CharacteristicHandle>;

    /// Write a frame to a characteristic
    async fn write_characteristic(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Write the client configuration descriptor of a characteristic
    async fn write_descriptor(
        &self,
        characteristic: &CharacteristicHandle,
        data: &[u8],
    ) -> Result<()>;

    /// Close the link
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::{
        error::BridgeError,
        profile::{ProtocolProfile, FTMS_CONTROL_POINT_UUID},
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockState {
        candidates: Vec<DeviceCandidate>,
        service: Option<Uuid>,
        characteristics: Vec<CharacteristicHandle>,
        failing_connects: usize,
        failing_discoveries: usize,
        connect_calls: usize,
        writes: Vec<(Uuid, Vec<u8>, WriteMode)>,
        descriptor_writes: Vec<(Uuid, Vec<u8>)>,
        events: Option<EventSender>,
        connected: bool,
    }

    /// Scripted transport recording everything the engine does
    pub(crate) struct MockTransport {
        state: Mutex<MockState>,
    }

    impl MockTransport {
        pub(crate) fn for_profile(profile: &ProtocolProfile, name: &str) -> Self {
            let mut characteristics: Vec<CharacteristicHandle> = profile
                .subscriptions
                .iter()
                .map(|uuid| CharacteristicHandle {
                    uuid: *uuid,
                    service: profile.service,
                    notify: *uuid != FTMS_CONTROL_POINT_UUID,
                    indicate: *uuid == FTMS_CONTROL_POINT_UUID,
                })
                .collect();
            if let Some(write) = profile.write {
                if !characteristics.iter().any(|c| c.uuid == write) {
                    characteristics.push(CharacteristicHandle {
                        uuid: write,
                        service: profile.service,
                        notify: false,
                        indicate: false,
                    });
                }
            }

            Self {
                state: Mutex::new(MockState {
                    candidates: vec![DeviceCandidate::new(
                        name.to_string(),
                        "AA:BB:CC:DD:EE:FF".to_string(),
                        -55,
                    )],
                    service: Some(profile.service),
                    characteristics,
                    ..MockState::default()
                }),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap()
        }

        pub(crate) fn candidate(&self) -> DeviceCandidate {
            self.lock().candidates[0].clone()
        }

        pub(crate) fn without_service(self) -> Self {
            self.lock().service = None;
            self
        }

        pub(crate) fn without_characteristic(self, uuid: Uuid) -> Self {
            self.lock().characteristics.retain(|c| c.uuid != uuid);
            self
        }

        pub(crate) fn failing_connects(self, count: usize) -> Self {
            self.lock().failing_connects = count;
            self
        }

        pub(crate) fn set_failing_connects(&self, count: usize) {
            self.lock().failing_connects = count;
        }

        pub(crate) fn failing_discoveries(self, count: usize) -> Self {
            self.lock().failing_discoveries = count;
            self
        }

        pub(crate) fn emit(&self, event: TransportEvent) -> bool {
            self.lock()
                .events
                .as_ref()
                .is_some_and(|tx| tx.send(event).is_ok())
        }

        pub(crate) fn notify(&self, characteristic: Uuid, value: &[u8]) -> bool {
            self.emit(TransportEvent::CharacteristicChanged {
                characteristic,
                value: Bytes::copy_from_slice(value),
                received_at: Instant::now(),
            })
        }

        /// Simulate an unexpected link loss
        pub(crate) fn drop_link(&self) -> bool {
            self.lock().connected = false;
            self.emit(TransportEvent::ControllerStateChanged(
                ControllerState::Disconnected,
            ))
        }

        pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
            self.lock().writes.iter().map(|(_, d, _)| d.clone()).collect()
        }

        pub(crate) fn write_modes(&self) -> Vec<WriteMode> {
            self.lock().writes.iter().map(|(_, _, m)| *m).collect()
        }

        pub(crate) fn descriptor_writes(&self) -> Vec<(Uuid, Vec<u8>)> {
            self.lock().descriptor_writes.clone()
        }

        pub(crate) fn connect_calls(&self) -> usize {
            self.lock().connect_calls
        }

        pub(crate) fn is_connected(&self) -> bool {
            self.lock().connected
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn scan(
            &self,
            prefixes: &[String],
            _params: &ConnectionParams,
        ) -> Result<Vec<DeviceCandidate>> {
            Ok(self
                .lock()
                .candidates
                .iter()
                .filter(|c| prefixes.iter().any(|p| c.matches_prefix(p)))
                .cloned()
                .collect())
        }

        async fn connect(
            &self,
            candidate: &DeviceCandidate,
            _params: &ConnectionParams,
            events: EventSender,
        ) -> Result<()> {
            let mut state = self.lock();
            state.connect_calls += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BridgeError::ConnectionFailed(format!(
                    "{} did not answer",
                    candidate.name
                )));
            }
            state.connected = true;
            state.events = Some(events);
            Ok(())
        }

        async fn discover_services(&self) -> Result<()> {
            let mut state = self.lock();
            if !state.connected {
                return Err(BridgeError::Disconnected);
            }
            if state.failing_discoveries > 0 {
                state.failing_discoveries -= 1;
                return Err(BridgeError::Timeout { timeout_ms: 5000 });
            }
            Ok(())
        }

        async fn create_service_object(&self, uuid: Uuid) -> Result<Option<ServiceHandle>> {
            Ok(self
                .lock()
                .service
                .filter(|s| *s == uuid)
                .map(|uuid| ServiceHandle { uuid }))
        }

        async fn discover_characteristics(
            &self,
            service: &ServiceHandle,
        ) -> Result<Vec<CharacteristicHandle>> {
            Ok(self
                .lock()
                .characteristics
                .iter()
                .filter(|c| c.service == service.uuid)
                .cloned()
                .collect())
        }

        async fn characteristic(
            &self,
            service: &ServiceHandle,
            uuid: Uuid,
        ) -> Option<CharacteristicHandle> {
            self.lock()
                .characteristics
                .iter()
                .find(|c| c.service == service.uuid && c.uuid == uuid)
                .cloned()
        }

        async fn write_characteristic(
            &self,
            characteristic: &CharacteristicHandle,
            data: &[u8],
            mode: WriteMode,
        ) -> Result<()> {
            let mut state = self.lock();
            if !state.connected {
                return Err(BridgeError::Disconnected);
            }
            state.writes.push((characteristic.uuid, data.to_vec(), mode));
            Ok(())
        }

        async fn write_descriptor(
            &self,
            characteristic: &CharacteristicHandle,
            data: &[u8],
        ) -> Result<()> {
            self.lock()
                .descriptor_writes
                .push((characteristic.uuid, data.to_vec()));
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            let mut state = self.lock();
            state.connected = false;
            state.events = None;
            Ok(())
        }
    }
}
