use crate::{
    discovery::{DiscoveredHandles, DiscoveryCoordinator},
    dispatch::{CommandDispatcher, DispatchPhase},
    error::{BridgeError, Result},
    metrics::MetricsAggregator,
    peripheral::{CommandSender, VirtualPeripheral},
    profile::ProtocolProfile,
    protocol::{codec_for, Codec, TelemetryFrame},
    supervisor::{ConnectOutcome, ConnectionSupervisor},
    transport::{ControllerState, EventSender, Transport, TransportEvent},
    types::{
        BridgeSettings, ConnectionParams, DeviceCandidate, HeartRateSample, MetricSet,
        OperatorCommand, SessionState, SessionSummary,
    },
};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Builder for a [`DeviceSession`] and its [`SessionHandle`]
///
/// # Examples
///
/// ```no_run
/// use fitbridge::{ble::BleTransport, profile::SPORTSTECH_BIKE, BridgeSettings, SessionBuilder};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(BleTransport::new().await?);
///     let (session, handle) = SessionBuilder::new(&SPORTSTECH_BIKE, transport)
///         .settings(BridgeSettings {
///             weight_kg: 82.0,
///             ..Default::default()
///         })
///         .build();
///
///     let task = tokio::spawn(session.run());
///     handle.request(fitbridge::OperatorCommand::TargetResistance(8))?;
///
///     handle.shutdown();
///     let summary = task.await??;
///     println!("{:.2} km", summary.metrics.distance_km);
///     Ok(())
/// }
/// ```
pub struct SessionBuilder {
    profile: &'static ProtocolProfile,
    transport: Arc<dyn Transport>,
    settings: BridgeSettings,
    params: ConnectionParams,
    name_filter: Option<Vec<String>>,
    candidate: Option<DeviceCandidate>,
    peripheral: Option<Box<dyn VirtualPeripheral>>,
}

impl SessionBuilder {
    /// Start building a session for `profile` over `transport`
    #[must_use]
    pub fn new(profile: &'static ProtocolProfile, transport: Arc<dyn Transport>) -> Self {
        Self {
            profile,
            transport,
            settings: BridgeSettings::default(),
            params: ConnectionParams::default(),
            name_filter: None,
            candidate: None,
            peripheral: None,
        }
    }

    /// Initial operator settings
    #[must_use]
    pub fn settings(mut self, settings: BridgeSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Scan and connect parameters
    #[must_use]
    pub const fn params(mut self, params: ConnectionParams) -> Self {
        self.params = params;
        self
    }

    /// Replace the profile's default advertised-name prefixes
    #[must_use]
    pub fn name_filter<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.name_filter = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    /// Connect to a known device instead of scanning
    #[must_use]
    pub fn candidate(mut self, candidate: DeviceCandidate) -> Self {
        self.candidate = Some(candidate);
        self
    }

    /// Republish the session through a virtual peripheral
    #[must_use]
    pub fn virtual_peripheral(mut self, peripheral: Box<dyn VirtualPeripheral>) -> Self {
        self.peripheral = Some(peripheral);
        self
    }

    /// Create the session and the handle controlling it
    #[must_use]
    pub fn build(self) -> (DeviceSession, SessionHandle) {
        let profile = self.profile;
        let codec: Arc<dyn Codec> = Arc::from(codec_for(profile));
        let name_filter = self.name_filter.unwrap_or_else(|| {
            profile
                .name_prefixes
                .iter()
                .map(ToString::to_string)
                .collect()
        });
        let mut supervisor = ConnectionSupervisor::new(name_filter, self.params);
        if let Some(candidate) = self.candidate {
            supervisor = supervisor.with_candidate(candidate);
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (metrics_tx, metrics_rx) = watch::channel(MetricSet::default());
        let (settings_tx, settings_rx) = watch::channel(self.settings);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (heart_tx, heart_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let commands = CommandSender::new(commands_tx);

        let session = DeviceSession {
            profile,
            transport: self.transport,
            codec: codec.clone(),
            supervisor,
            discovery: DiscoveryCoordinator::new(profile),
            aggregator: MetricsAggregator::new(profile.class),
            dispatcher: CommandDispatcher::new(profile, codec),
            handles: None,
            state: SessionState::Disconnected,
            state_tx,
            metrics_tx,
            settings_rx,
            shutdown_rx,
            commands: commands.clone(),
            commands_rx,
            heart_rx,
            events_tx,
            events_rx,
            peripheral: self.peripheral,
            peripheral_started: false,
        };

        let handle = SessionHandle {
            state: state_rx,
            metrics: metrics_rx,
            settings: settings_tx,
            shutdown: shutdown_tx,
            commands,
            heart: heart_tx,
        };

        (session, handle)
    }
}

/// Control surface of a running [`DeviceSession`]
///
/// Dropping the handle tears the session down.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    metrics: watch::Receiver<MetricSet>,
    settings: watch::Sender<BridgeSettings>,
    shutdown: watch::Sender<bool>,
    commands: CommandSender,
    heart: mpsc::UnboundedSender<HeartRateSample>,
}

impl SessionHandle {
    /// Current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disconnected`] if the session ends first.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| BridgeError::Disconnected)
    }

    /// Latest metric snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricSet {
        self.metrics.borrow().clone()
    }

    /// Watch metric snapshots, published once per tick and per applied frame
    #[must_use]
    pub fn subscribe_metrics(&self) -> watch::Receiver<MetricSet> {
        self.metrics.clone()
    }

    /// Queue an operator request
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disconnected`] once the session has ended.
    pub fn request(&self, command: OperatorCommand) -> Result<()> {
        self.commands.send(command)
    }

    /// Sender for the inbound request path
    #[must_use]
    pub fn command_sender(&self) -> CommandSender {
        self.commands.clone()
    }

    /// Input for belt and platform heart-rate samples
    #[must_use]
    pub fn heart_rate_input(&self) -> mpsc::UnboundedSender<HeartRateSample> {
        self.heart.clone()
    }

    /// Current operator settings
    #[must_use]
    pub fn settings(&self) -> BridgeSettings {
        self.settings.borrow().clone()
    }

    /// Replace the operator settings; applied from the next tick on
    pub fn update_settings(&self, settings: BridgeSettings) {
        self.settings.send_replace(settings);
    }

    /// Ask the session to disconnect; `run` then returns the session summary
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// One bridged device: the single tick loop owning every piece of session state
///
/// Built by [`SessionBuilder`]; [`DeviceSession::run`] drives it until teardown.
pub struct DeviceSession {
    profile: &'static ProtocolProfile,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    supervisor: ConnectionSupervisor,
    discovery: DiscoveryCoordinator,
    aggregator: MetricsAggregator,
    dispatcher: CommandDispatcher,
    handles: Option<DiscoveredHandles>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    metrics_tx: watch::Sender<MetricSet>,
    settings_rx: watch::Receiver<BridgeSettings>,
    shutdown_rx: watch::Receiver<bool>,
    commands: CommandSender,
    commands_rx: mpsc::UnboundedReceiver<OperatorCommand>,
    heart_rx: mpsc::UnboundedReceiver<HeartRateSample>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    peripheral: Option<Box<dyn VirtualPeripheral>>,
    peripheral_started: bool,
}

impl DeviceSession {
    /// Profile the session runs
    #[must_use]
    pub const fn profile(&self) -> &'static ProtocolProfile {
        self.profile
    }

    /// Drive the session until shutdown
    ///
    /// Transient failures never leave this loop: dropped frames, ack timeouts and lost
    /// links are logged and handled inside it.
    ///
    /// # Errors
    ///
    /// Returns an error only for terminal outcomes: no matching device, a failed first
    /// connect, or a device lacking the profile's service or characteristics.
    pub async fn run(mut self) -> Result<SessionSummary> {
        if self.supervisor.candidate().is_none() {
            self.set_state(SessionState::Discovering);
            if let Err(e) = self.supervisor.start_scanning(&*self.transport).await {
                error!("Discovery failed: {}", e);
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
        }

        self.establish().await?;

        let mut ticker = interval(self.profile.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    if let Err(e) = self.handle_event(event).await {
                        self.teardown().await;
                        return Err(e);
                    }
                }
                Some(command) = self.commands_rx.recv() => {
                    self.dispatcher.request(command);
                }
                Some(sample) = self.heart_rx.recv() => {
                    let settings = self.settings_rx.borrow().clone();
                    self.aggregator.apply_heart_sample(sample, &settings);
                    self.publish_metrics();
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.on_tick().await {
                        self.teardown().await;
                        return Err(e);
                    }
                }
            }
        }

        info!("Shutting down {} session", self.profile.name);
        self.teardown().await;
        Ok(self.aggregator.into_summary())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("{}: {} -> {}", self.profile.name, self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn publish_metrics(&self) {
        self.metrics_tx.send_replace(self.aggregator.snapshot());
    }

    /// Connect and discover; `Ok(false)` means retry on a later tick
    async fn establish(&mut self) -> Result<bool> {
        self.set_state(SessionState::Connecting);
        match self
            .supervisor
            .connect(&*self.transport, self.events_tx.clone())
            .await
        {
            ConnectOutcome::Connected => {}
            ConnectOutcome::Retry(_) => {
                self.set_state(SessionState::Disconnected);
                return Ok(false);
            }
            ConnectOutcome::Terminal(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(e);
            }
        }

        self.set_state(SessionState::ServicesDiscovering);
        match self.discovery.discover(&*self.transport).await {
            Ok(handles) => {
                self.handles = Some(handles);
                self.set_state(SessionState::CharacteristicsReady);
                self.start_peripheral();
                Ok(true)
            }
            Err(e) if e.is_fatal() => {
                error!("{} unusable: {}", self.profile.name, e);
                self.close_link().await;
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
            Err(e) => {
                warn!("Discovery on {} failed: {}", self.profile.name, e);
                self.close_link().await;
                self.set_state(SessionState::Disconnected);
                self.supervisor.on_transport_disconnected();
                Ok(false)
            }
        }
    }

    fn start_peripheral(&mut self) {
        if self.peripheral_started {
            return;
        }
        let kind = self
            .settings_rx
            .borrow()
            .emulation_kind(self.profile.class);
        let (Some(kind), Some(peripheral)) = (kind, self.peripheral.as_mut()) else {
            return;
        };
        self.peripheral_started = true;
        match peripheral.start(kind, self.commands.clone()) {
            Ok(()) => info!("Virtual {:?} peripheral started", kind),
            Err(e) => error!("Virtual peripheral failed to start: {}", e),
        }
    }

    async fn close_link(&mut self) {
        self.handles = None;
        if let Err(e) = self.transport.disconnect().await {
            debug!("Disconnect: {}", e);
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::CharacteristicChanged {
                characteristic,
                value,
                received_at,
            } => {
                self.dispatcher.on_notification(characteristic);
                self.on_frame(&TelemetryFrame {
                    characteristic,
                    data: value,
                    received_at,
                });
            }
            TransportEvent::CharacteristicWritten { value, .. } => {
                debug!("Write confirmed {:02X?}", &value[..]);
                self.dispatcher.on_write_confirmed();
            }
            TransportEvent::ServiceStateChanged(state) => {
                debug!("Service state {:?}", state);
            }
            TransportEvent::ControllerStateChanged(ControllerState::Connected) => {
                debug!("Controller connected");
            }
            TransportEvent::ControllerStateChanged(ControllerState::Disconnected) => {
                return self.on_link_lost().await;
            }
            TransportEvent::ServiceError(code) => {
                error!("Service error: {}", code);
                return self.on_link_lost().await;
            }
            TransportEvent::ControllerError(code) => {
                error!("Controller error: {}", code);
                return self.on_link_lost().await;
            }
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: &TelemetryFrame) {
        if frame.characteristic != self.profile.telemetry || !self.state.accepts_telemetry() {
            return;
        }
        debug!("<< {:02X?}", &frame.data[..]);

        match self.codec.decode(&frame.data) {
            Ok(delta) => {
                let settings = self.settings_rx.borrow().clone();
                self.aggregator.apply(&delta, frame.received_at, &settings);
                self.publish_metrics();
            }
            Err(e) => warn!("Dropping frame: {}", e),
        }
    }

    async fn on_link_lost(&mut self) -> Result<()> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }
        warn!("{} disconnected", self.profile.name);
        self.dispatcher.reset();
        self.aggregator.pause();
        self.close_link().await;
        self.set_state(SessionState::Disconnected);
        self.publish_metrics();

        if self.supervisor.on_transport_disconnected() {
            self.establish().await?;
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<()> {
        let now = Instant::now();

        if self.state == SessionState::Disconnected {
            if self.supervisor.reconnect_pending() {
                self.establish().await?;
            }
            return Ok(());
        }
        if !self.state.accepts_telemetry() {
            return Ok(());
        }

        if let Some(frame) = self.dispatcher.tick(now, self.aggregator.metrics()) {
            self.write(&frame).await;
        }

        if self.state == SessionState::CharacteristicsReady
            && self.dispatcher.phase() != DispatchPhase::Uninitialized
        {
            self.set_state(SessionState::Initializing);
        }
        if self.state == SessionState::Initializing && self.dispatcher.is_initialized() {
            self.set_state(SessionState::Ready);
        }

        if self.state == SessionState::Ready {
            self.aggregator.advance_clock(now);
            if self.peripheral_started {
                if let Some(peripheral) = self.peripheral.as_mut() {
                    peripheral.push(self.aggregator.metrics());
                }
            }
        }
        self.publish_metrics();
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) {
        let Some(target) = self.handles.as_ref().and_then(|h| h.write.as_ref()) else {
            warn!("{} has no write characteristic, dropping {:02X?}", self.profile.name, frame);
            return;
        };
        debug!(">> {:02X?}", frame);
        if let Err(e) = self
            .transport
            .write_characteristic(target, frame, self.profile.write_mode)
            .await
        {
            warn!("Write failed: {}", e);
        }
    }

    async fn teardown(&mut self) {
        if self.handles.is_some() || self.supervisor.ever_connected() {
            self.close_link().await;
        }
        self.aggregator.pause();
        self.set_state(SessionState::Disconnected);
        self.publish_metrics();
    }
}
