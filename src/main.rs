use heart_rate_monitor::domain::models::{
    BodySensorLocation, DeviceId, HeartRateMeasurement, SessionEvent, SessionState,
};
use heart_rate_monitor::domain::settings::SettingsService;
use heart_rate_monitor::infrastructure::bluetooth::connection::SessionConfig;
use heart_rate_monitor::infrastructure::bluetooth::simulated::{
    SimulatedPeripheral, SimulatedRadio, SimulationTiming,
};
use heart_rate_monitor::infrastructure::bluetooth::{BluetoothService, MonitorHandle};
use heart_rate_monitor::infrastructure::logging;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

fn demo_peripherals() -> Vec<SimulatedPeripheral> {
    let strap = SimulatedPeripheral::heart_rate_strap("C4:7C:8D:6A:11:02", "HRM Chest Strap");

    let mut band = SimulatedPeripheral::heart_rate_strap("F0:13:C3:55:9E:41", "Wrist Band");
    band.rssi = -78;
    band.resting_bpm = 71;
    band.manufacturer_data = None;
    band.sensor_location = Some(BodySensorLocation::Wrist);
    band.reports_energy = false;

    vec![strap, band]
}

/// Scan and return the first device listed. `None` once the scan ends empty
/// or could not start.
async fn first_device(handle: &MonitorHandle) -> Option<DeviceId> {
    let mut events = handle.observe_events();
    handle.start_scan().ok()?;

    loop {
        match events.recv().await {
            Ok(SessionEvent::DevicesChanged(devices)) => {
                if let Some(device) = devices.first() {
                    return Some(device.identifier.clone());
                }
            }
            Ok(SessionEvent::StateChanged(SessionState::Idle)) | Ok(SessionEvent::Failure(_)) => {
                return None;
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return None,
        }
    }
}

fn log_measurement(m: &HeartRateMeasurement, verbose: bool) {
    let contact = match (m.sensor_contact_supported, m.sensor_contact_detected) {
        (false, _) => "n/a",
        (true, true) => "yes",
        (true, false) => "no",
    };
    let energy_kj = m.energy_expended_kjoules;
    let rr_ms = m.rr_intervals_ms();
    if verbose {
        info!(bpm = m.beats_per_minute, contact, ?energy_kj, ?rr_ms, "Heart rate");
    } else {
        debug!(bpm = m.beats_per_minute, contact, ?energy_kj, ?rr_ms, "Heart rate");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Heart Rate Monitor");
    if let Some(path) = settings_service.path() {
        info!("Settings: {}", path.display());
    }

    let config = SessionConfig::from_settings(&settings)?;
    let auto_connect = config.auto_connect;

    let (radio, radio_events) =
        SimulatedRadio::new(demo_peripherals(), SimulationTiming::default());
    let (service, handle) = BluetoothService::new(radio, radio_events, config);
    let service_task = tokio::spawn(service.run());

    let mut measurements = handle.observe_measurement();
    let mut events = handle.observe_events();

    if auto_connect {
        handle.start_scan()?;
    } else {
        match first_device(&handle).await {
            Some(identifier) => {
                info!("Selecting {}", identifier);
                handle.select_device(identifier)?;
            }
            None => anyhow::bail!("No heart rate sensor found"),
        }
    }

    loop {
        tokio::select! {
            measurement = measurements.recv() => match measurement {
                Ok(m) => log_measurement(&m, settings.log_settings.log_measurements),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} measurements", skipped),
                Err(RecvError::Closed) => break,
            },
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged(state)) => info!("Session: {}", state),
                Ok(SessionEvent::SensorLocation(location)) => info!("Sensor location: {:?}", location),
                Ok(SessionEvent::Warning(warning)) => warn!("{}", warning),
                Ok(SessionEvent::Failure(failure)) if failure.is_terminal() => error!("{}", failure),
                Ok(SessionEvent::Failure(rejected)) => warn!("{}", rejected),
                Ok(SessionEvent::RadioUnavailable(adapter)) => warn!("Bluetooth {}", adapter),
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    let mut state = handle.current_session_state();
    if state.borrow().has_link() {
        handle.disconnect()?;
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SessionState::Idle),
        )
        .await;
    }

    drop(handle);
    service_task.await??;
    Ok(())
}
