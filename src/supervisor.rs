use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{
    error::{BridgeError, Result},
    transport::{EventSender, Transport},
    types::{ConnectionParams, DeviceCandidate},
};

/// Result of one connect attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    /// Link established
    Connected,
    /// The device was never reachable; the session must end
    Terminal(BridgeError),
    /// A reconnect after an earlier link failed; try again later
    Retry(BridgeError),
}

/// Scan, match and (re)connect policy of a session
///
/// A failure on the very first connect is terminal. Once a link has existed, every
/// drop is followed by an immediate reconnect and failed reconnects are retried
/// without limit.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    name_filter: Vec<String>,
    params: ConnectionParams,
    candidate: Option<DeviceCandidate>,
    ever_connected: bool,
    reconnect_pending: bool,
    reconnect_attempts: u32,
}

impl ConnectionSupervisor {
    /// Create a supervisor matching advertised names against `name_filter`
    #[must_use]
    pub const fn new(name_filter: Vec<String>, params: ConnectionParams) -> Self {
        Self {
            name_filter,
            params,
            candidate: None,
            ever_connected: false,
            reconnect_pending: false,
            reconnect_attempts: 0,
        }
    }

    /// Skip scanning and connect to a known device
    #[must_use]
    pub fn with_candidate(mut self, candidate: DeviceCandidate) -> Self {
        self.candidate = Some(candidate);
        self
    }

    /// Device the session is bound to
    #[must_use]
    pub const fn candidate(&self) -> Option<&DeviceCandidate> {
        self.candidate.as_ref()
    }

    /// Whether a link was ever established
    #[must_use]
    pub const fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    /// Whether a reconnect attempt is owed
    #[must_use]
    pub const fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Scan for matching devices and bind to the strongest one
    ///
    /// Candidates are returned strongest signal first.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceNotFound`] when nothing matches the filter, or the
    /// transport's scan error.
    pub async fn start_scanning(&mut self, transport: &dyn Transport) -> Result<Vec<DeviceCandidate>> {
        info!("Scanning for devices matching {:?}", self.name_filter);
        let mut candidates: Vec<DeviceCandidate> = transport
            .scan(&self.name_filter, &self.params)
            .await?
            .into_iter()
            .filter(|c| self.name_filter.iter().any(|prefix| c.matches_prefix(prefix)))
            .collect();
        candidates.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        let Some(best) = candidates.first() else {
            warn!("No device matched {:?}", self.name_filter);
            return Err(BridgeError::DeviceNotFound);
        };
        info!("Found {} ({}, {} dBm)", best.name, best.address, best.rssi);
        self.candidate = Some(best.clone());
        Ok(candidates)
    }

    /// Try to open a link to the bound device
    pub async fn connect(&mut self, transport: &dyn Transport, events: EventSender) -> ConnectOutcome {
        let Some(candidate) = self.candidate.clone() else {
            return ConnectOutcome::Terminal(BridgeError::DeviceNotFound);
        };
        if self.reconnect_pending {
            self.reconnect_attempts += 1;
            info!(
                "Reconnecting to {} (attempt {})",
                candidate.name, self.reconnect_attempts
            );
        } else {
            info!("Connecting to {}", candidate.name);
        }

        let limit = Duration::from_millis(self.params.timeout_ms);
        let result = match timeout(limit, transport.connect(&candidate, &self.params, events)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                timeout_ms: self.params.timeout_ms,
            }),
        };

        match result {
            Ok(()) => {
                info!("Connected to {}", candidate.name);
                self.ever_connected = true;
                self.reconnect_pending = false;
                self.reconnect_attempts = 0;
                ConnectOutcome::Connected
            }
            Err(e) if self.ever_connected => {
                warn!("Reconnect to {} failed: {}", candidate.name, e);
                self.reconnect_pending = true;
                ConnectOutcome::Retry(e)
            }
            Err(e) => {
                error!("Cannot connect to {}: {}", candidate.name, e);
                ConnectOutcome::Terminal(e)
            }
        }
    }

    /// The link dropped; returns whether to reconnect right away
    pub fn on_transport_disconnected(&mut self) -> bool {
        if self.ever_connected {
            warn!("Link lost, reconnecting");
            self.reconnect_pending = true;
        }
        self.ever_connected
    }
}
