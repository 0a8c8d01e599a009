//! Contract with the layer that republishes a session to third-party apps.
//!
//! The session owns an optional [`VirtualPeripheral`]. It is started once, when the
//! equipment's characteristics first become ready, and afterwards receives a metric
//! snapshot on every tick while the session is `Ready`. Requests coming back from the
//! third-party side travel through the [`CommandSender`] it was started with.

use tokio::sync::mpsc;

use crate::{
    error::{BridgeError, Result},
    types::{EmulationKind, MetricSet, OperatorCommand},
};

/// Inbound path for operator requests into a running session
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<OperatorCommand>,
}

impl CommandSender {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<OperatorCommand>) -> Self {
        Self { tx }
    }

    /// Queue a request for the session's dispatcher
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disconnected`] once the session has ended.
    pub fn send(&self, command: OperatorCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| BridgeError::Disconnected)
    }
}

/// Standardized peripheral republishing the session's metrics
pub trait VirtualPeripheral: Send {
    /// Bring the peripheral up as `kind`
    ///
    /// # Errors
    ///
    /// Implementations return an error when the peripheral cannot be advertised; the
    /// session logs it and keeps running without emulation.
    fn start(&mut self, kind: EmulationKind, commands: CommandSender) -> Result<()>;

    /// Publish the latest snapshot; must not block
    fn push(&mut self, metrics: &MetricSet);
}
