//! Bluetooth Service Module
//!
//! Async driver that serialises commands, radio callbacks and the scan timer
//! into the [`ConnectionSession`], and fans its events out to observers.

use crate::domain::models::{
    BluetoothCommand, DeviceId, DiscoveredDevice, HeartRateMeasurement, SessionEvent,
    SessionState,
};
use crate::infrastructure::bluetooth::connection::{ConnectionSession, SessionConfig};
use crate::infrastructure::bluetooth::radio::{Radio, RadioEvent};
use anyhow::Result;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

const BROADCAST_CAPACITY: usize = 64;

/// Presentation-facing handle: commands in, observable state out.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<BluetoothCommand>,
    devices: watch::Receiver<Vec<DiscoveredDevice>>,
    state: watch::Receiver<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    measurements: broadcast::Sender<HeartRateMeasurement>,
    events: broadcast::Sender<SessionEvent>,
}

impl MonitorHandle {
    pub fn start_scan(&self) -> Result<()> {
        self.send(BluetoothCommand::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(BluetoothCommand::StopScan)
    }

    pub fn select_device(&self, identifier: DeviceId) -> Result<()> {
        self.send(BluetoothCommand::SelectDevice(identifier))
    }

    pub fn cancel(&self) -> Result<()> {
        self.send(BluetoothCommand::Cancel)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(BluetoothCommand::Disconnect)
    }

    pub fn reset_energy_expended(&self) -> Result<()> {
        self.send(BluetoothCommand::ResetEnergyExpended)
    }

    /// Current device snapshot, then every change.
    pub fn observe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices.clone()
    }

    /// Every state transition in order, including transient `Failed`,
    /// `Cancelled` and `Disconnecting`.
    pub fn observe_session_state(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    /// Latest session state only; intermediate transitions may be skipped.
    pub fn current_session_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn observe_measurement(&self) -> broadcast::Receiver<HeartRateMeasurement> {
        self.measurements.subscribe()
    }

    /// Every session event, including warnings and failures.
    pub fn observe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: BluetoothCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow::anyhow!("Bluetooth service has stopped"))
    }
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<R: Radio> {
    session: ConnectionSession<R>,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<BluetoothCommand>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    state_tx: watch::Sender<SessionState>,
    transitions_tx: broadcast::Sender<SessionState>,
    measurements_tx: broadcast::Sender<HeartRateMeasurement>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl<R: Radio> BluetoothService<R> {
    /// Create a new Bluetooth service around `radio`, whose callbacks arrive
    /// on `radio_events`.
    pub fn new(
        radio: R,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        config: SessionConfig,
    ) -> (Self, MonitorHandle) {
        let (session_tx, session_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (devices_tx, devices_rx) = watch::channel(Vec::new());
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (transitions_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (measurements_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let handle = MonitorHandle {
            commands: commands_tx,
            devices: devices_rx,
            state: state_rx,
            transitions: transitions_tx.clone(),
            measurements: measurements_tx.clone(),
            events: events_tx.clone(),
        };

        let service = Self {
            session: ConnectionSession::new(radio, config, session_tx),
            session_events,
            commands,
            radio_events,
            devices_tx,
            state_tx,
            transitions_tx,
            measurements_tx,
            events_tx,
        };

        (service, handle)
    }

    /// Run until every [`MonitorHandle`] is dropped or the radio goes away.
    pub async fn run(mut self) -> Result<()> {
        info!("Bluetooth service started");
        let scan_timeout = self.session.config().scan_timeout;
        let mut scan_deadline: Option<Instant> = None;

        // Adapter state reported before the loop starts must be applied
        // before the first command
        while let Ok(event) = self.radio_events.try_recv() {
            self.session.handle_radio_event(event);
        }
        self.publish();

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    debug!("Command: {:?}", command);
                    // Failures are already published as session events
                    let _ = self.session.handle_command(command);
                }
                event = self.radio_events.recv() => {
                    let Some(event) = event else {
                        info!("Radio event stream closed");
                        break;
                    };
                    self.session.handle_radio_event(event);
                }
                _ = sleep_until(scan_deadline), if scan_deadline.is_some() => {
                    scan_deadline = None;
                    self.session.scan_timed_out();
                }
            }

            self.publish();

            scan_deadline = match (self.session.state(), scan_timeout) {
                (SessionState::Scanning, Some(timeout)) => {
                    scan_deadline.or_else(|| Instant::now().checked_add(timeout))
                }
                _ => None,
            };
        }

        if self.session.state().has_link() {
            let _ = self.session.disconnect();
            self.publish();
        }
        info!("Bluetooth service stopped");
        Ok(())
    }

    fn publish(&mut self) {
        while let Ok(event) = self.session_events.try_recv() {
            match &event {
                SessionEvent::StateChanged(state) => {
                    self.state_tx.send_replace(*state);
                    let _ = self.transitions_tx.send(*state);
                }
                SessionEvent::DevicesChanged(devices) => {
                    self.devices_tx.send_replace(devices.clone());
                }
                SessionEvent::Measurement(measurement) => {
                    let _ = self.measurements_tx.send(measurement.clone());
                }
                _ => {}
            }
            let _ = self.events_tx.send(event);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
