use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while bridging a fitness device
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No device matched the name filter during scanning
    #[error("No matching fitness device found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// The profile's GATT service is not exposed by the device
    #[error("Service {uuid} not found on device")]
    ServiceNotFound {
        /// Service UUID that was looked up
        uuid: Uuid,
    },

    /// A characteristic required by the profile is missing
    #[error("Characteristic {uuid} not found on device")]
    CharacteristicNotFound {
        /// Characteristic UUID that was looked up
        uuid: Uuid,
    },

    /// Operation timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Telemetry frame parsing failed
    #[error("Failed to parse frame: {0}")]
    ParseError(String),

    /// The device profile cannot express the requested operation
    #[error("Unsupported by profile: {0}")]
    Unsupported(String),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectionFailed(_) | Self::Disconnected | Self::DeviceNotFound
        )
    }

    /// Check if this error must end the session without any retry
    ///
    /// A device that does not expose the profile's service or characteristics is
    /// never going to work, so discovery failures are terminal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ServiceNotFound { .. } | Self::CharacteristicNotFound { .. } | Self::DeviceNotFound
        )
    }

    /// Check if this error is recoverable within the running session
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ParseError(_) | Self::InvalidParameters(_)
        )
    }
}
