use tracing::{debug, error, info, warn};

use crate::{
    error::{BridgeError, Result},
    profile::{ProtocolProfile, CCC_ENABLE_INDICATE, CCC_ENABLE_NOTIFY},
    transport::{CharacteristicHandle, ServiceHandle, Transport},
};

/// Handles resolved for a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHandles {
    /// The profile's service
    pub service: ServiceHandle,
    /// Telemetry characteristic
    pub telemetry: CharacteristicHandle,
    /// Command characteristic, absent on read-only profiles
    pub write: Option<CharacteristicHandle>,
    /// Characteristics with notifications or indications enabled
    pub subscribed: Vec<CharacteristicHandle>,
}

/// Drives service and characteristic discovery for one profile
///
/// Any missing service or characteristic fails the session; nothing here retries.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryCoordinator {
    profile: &'static ProtocolProfile,
}

impl DiscoveryCoordinator {
    /// Create a coordinator for `profile`
    #[must_use]
    pub const fn new(profile: &'static ProtocolProfile) -> Self {
        Self { profile }
    }

    /// Resolve every handle the profile needs and enable notifications
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ServiceNotFound`] or [`BridgeError::CharacteristicNotFound`]
    /// when the device does not expose what the profile requires, or the transport's
    /// error when a GATT operation fails.
    pub async fn discover(&self, transport: &dyn Transport) -> Result<DiscoveredHandles> {
        let profile = self.profile;
        transport.discover_services().await?;

        let Some(service) = transport.create_service_object(profile.service).await? else {
            error!("{} service {} not found", profile.name, profile.service);
            return Err(BridgeError::ServiceNotFound {
                uuid: profile.service,
            });
        };

        for characteristic in transport.discover_characteristics(&service).await? {
            debug!(
                "Characteristic {} (notify: {}, indicate: {})",
                characteristic.uuid, characteristic.notify, characteristic.indicate
            );
        }

        let telemetry = self.resolve(transport, &service, profile.telemetry).await?;
        let write = match profile.write {
            Some(uuid) => Some(self.resolve(transport, &service, uuid).await?),
            None => None,
        };

        let mut subscribed = Vec::with_capacity(profile.subscriptions.len());
        for uuid in profile.subscriptions {
            let characteristic = self.resolve(transport, &service, *uuid).await?;
            let payload = if characteristic.notify {
                CCC_ENABLE_NOTIFY
            } else if characteristic.indicate {
                CCC_ENABLE_INDICATE
            } else {
                warn!("{} declares neither notify nor indicate", characteristic.uuid);
                continue;
            };
            transport.write_descriptor(&characteristic, &payload).await?;
            debug!("Subscribed to {} ({:02X?})", characteristic.uuid, payload);
            subscribed.push(characteristic);
        }

        info!("{} characteristics ready", profile.name);
        Ok(DiscoveredHandles {
            service,
            telemetry,
            write,
            subscribed,
        })
    }

    async fn resolve(
        &self,
        transport: &dyn Transport,
        service: &ServiceHandle,
        uuid: uuid::Uuid,
    ) -> Result<CharacteristicHandle> {
        transport.characteristic(service, uuid).await.ok_or_else(|| {
            error!("{} characteristic {} not found", self.profile.name, uuid);
            BridgeError::CharacteristicNotFound { uuid }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        profile::{HEART_RATE_BELT, SPORTSTECH_BIKE, TECHNOGYM_MYRUN},
        transport::mock::MockTransport,
        types::ConnectionParams,
    };
    use tokio::sync::mpsc;

    async fn connected(mock: MockTransport) -> MockTransport {
        let (tx, _rx) = mpsc::unbounded_channel();
        mock.connect(&mock.candidate(), &ConnectionParams::default(), tx)
            .await
            .unwrap();
        mock
    }

    #[tokio::test]
    async fn test_discovery_subscribes_telemetry() {
        let mock = connected(MockTransport::for_profile(&SPORTSTECH_BIKE, "EW-BK 01")).await;
        let handles = DiscoveryCoordinator::new(&SPORTSTECH_BIKE)
            .discover(&mock)
            .await
            .unwrap();

        assert_eq!(handles.telemetry.uuid, SPORTSTECH_BIKE.telemetry);
        assert_eq!(handles.write.map(|w| w.uuid), SPORTSTECH_BIKE.write);
        assert_eq!(
            mock.descriptor_writes(),
            vec![(SPORTSTECH_BIKE.telemetry, vec![0x01, 0x00])]
        );
    }

    #[tokio::test]
    async fn test_discovery_uses_indicate_for_control_point() {
        let mock = connected(MockTransport::for_profile(&TECHNOGYM_MYRUN, "MYRUN 7781")).await;
        let handles = DiscoveryCoordinator::new(&TECHNOGYM_MYRUN)
            .discover(&mock)
            .await
            .unwrap();

        assert_eq!(handles.subscribed.len(), 2);
        let writes = mock.descriptor_writes();
        assert_eq!(writes[0].1, vec![0x01, 0x00]);
        assert_eq!(writes[1], (TECHNOGYM_MYRUN.write.unwrap(), vec![0x02, 0x00]));
    }

    #[tokio::test]
    async fn test_read_only_profile_has_no_write_handle() {
        let mock = connected(MockTransport::for_profile(&HEART_RATE_BELT, "Polar H10")).await;
        let handles = DiscoveryCoordinator::new(&HEART_RATE_BELT)
            .discover(&mock)
            .await
            .unwrap();
        assert!(handles.write.is_none());
    }

    #[tokio::test]
    async fn test_missing_service_is_fatal() {
        let mock = connected(
            MockTransport::for_profile(&SPORTSTECH_BIKE, "EW-BK 01").without_service(),
        )
        .await;
        let err = DiscoveryCoordinator::new(&SPORTSTECH_BIKE)
            .discover(&mock)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ServiceNotFound { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_write_characteristic_is_fatal() {
        let write = SPORTSTECH_BIKE.write.unwrap();
        let mock = connected(
            MockTransport::for_profile(&SPORTSTECH_BIKE, "EW-BK 01").without_characteristic(write),
        )
        .await;
        let err = DiscoveryCoordinator::new(&SPORTSTECH_BIKE)
            .discover(&mock)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::CharacteristicNotFound { uuid } if uuid == write));
        assert!(mock.descriptor_writes().is_empty());
    }
}
