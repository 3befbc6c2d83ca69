//! Bluetooth link monitor.
//!
//! Resolves the configured headset once, then polls its connection state.
//! Drops trigger bounded reconnects; while connected, the output route is
//! periodically checked for drift. Playback pauses polling by aborting the
//! poll task, so a poll in flight never races playback's own device
//! enforcement.

use super::controller::BluetoothController;
use crate::audio::device::DeviceController;
use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::events::{AssistantEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Link monitor activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkEvent {
    /// Device identity found among paired devices.
    Resolved { device: String, address: String },
    Connected { device: String },
    Disconnected { device: String },
    Reconnected { device: String, attempts: u32 },
    ReconnectFailed { device: String, attempts: u32 },
    /// Output had drifted to `from` and was moved back.
    DriftCorrected { device: String, from: String },
}

#[derive(Debug, Clone)]
pub struct LinkMonitorConfig {
    /// Paired device name, matched case-insensitively.
    pub device_name: String,
    pub poll_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_wait: Duration,
    /// Check for output drift every this many stable polls.
    pub drift_check_every: u32,
}

impl LinkMonitorConfig {
    pub fn new(device_name: &str) -> Self {
        Self {
            device_name: device_name.to_string(),
            poll_interval: Duration::from_millis(defaults::BLUETOOTH_POLL_INTERVAL_MS),
            reconnect_attempts: defaults::BLUETOOTH_RECONNECT_ATTEMPTS,
            reconnect_wait: Duration::from_millis(defaults::BLUETOOTH_RECONNECT_WAIT_MS),
            drift_check_every: defaults::BLUETOOTH_DRIFT_CHECK_EVERY,
        }
    }
}

#[derive(Default)]
struct LinkState {
    address: Option<String>,
    /// Paired name as reported by the controller; also the audio route name.
    device: String,
    connected: bool,
    reconnect_pending: bool,
    stable_polls: u32,
    playback_lock: bool,
    poll_task: Option<JoinHandle<()>>,
}

struct Shared {
    controller: Arc<dyn BluetoothController>,
    devices: Arc<dyn DeviceController>,
    config: LinkMonitorConfig,
    events: EventBus,
    state: Mutex<LinkState>,
}

/// Watches one Bluetooth headset. Cloning shares the monitor.
#[derive(Clone)]
pub struct LinkMonitor {
    shared: Arc<Shared>,
}

impl LinkMonitor {
    pub fn new(
        controller: Arc<dyn BluetoothController>,
        devices: Arc<dyn DeviceController>,
        config: LinkMonitorConfig,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                controller,
                devices,
                config,
                events,
                state: Mutex::new(LinkState::default()),
            }),
        }
    }

    /// Resolves the device identity and starts polling.
    ///
    /// On failure the error is logged once and returned; only the monitor
    /// is disabled.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let wanted = shared.config.device_name.trim();

        let paired = match shared.controller.paired_devices().await {
            Ok(paired) => paired,
            Err(e) => {
                error!(device = wanted, error = %e, "Bluetooth monitor disabled: cannot list paired devices");
                return Err(e);
            }
        };

        let found = paired
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(wanted))
            .or_else(|| {
                let wanted = wanted.to_lowercase();
                paired
                    .iter()
                    .find(|d| !wanted.is_empty() && d.name.to_lowercase().contains(&wanted))
            });

        let Some(device) = found else {
            error!(device = wanted, paired = paired.len(), "Bluetooth monitor disabled: device not paired");
            return Err(VoiceError::BluetoothDeviceNotFound {
                name: wanted.to_string(),
            });
        };

        info!(device = %device.name, address = %device.address, connected = device.connected, "Bluetooth device resolved");
        {
            let mut state = shared.lock();
            state.address = Some(device.address.clone());
            state.device = device.name.clone();
            state.connected = device.connected;
            state.stable_polls = 0;
        }
        shared.emit(LinkEvent::Resolved {
            device: device.name.clone(),
            address: device.address.clone(),
        });

        self.arm(false);
        Ok(())
    }

    /// Cancels polling for the duration of a playback.
    pub fn pause_for_playback(&self) {
        let task = {
            let mut state = self.shared.lock();
            state.playback_lock = true;
            state.poll_task.take()
        };
        if let Some(task) = task {
            task.abort();
            debug!("Bluetooth polling paused for playback");
        }
    }

    /// Re-arms polling after playback if a device identity is known.
    pub fn resume_after_playback(&self) {
        self.shared.lock().playback_lock = false;
        self.arm(true);
    }

    /// Stops polling for good.
    pub fn stop(&self) {
        let task = {
            let mut state = self.shared.lock();
            state.address = None;
            state.poll_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Runs one poll cycle inline.
    pub async fn poll_once(&self) {
        self.shared.poll_once().await;
    }

    pub fn is_polling(&self) -> bool {
        self.shared
            .lock()
            .poll_task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().connected
    }

    pub fn device_address(&self) -> Option<String> {
        self.shared.lock().address.clone()
    }

    fn arm(&self, immediate: bool) {
        let mut state = self.shared.lock();
        if state.address.is_none() || state.playback_lock {
            return;
        }
        if let Some(old) = state.poll_task.take() {
            old.abort();
        }
        // The task holds a weak handle so dropping the last monitor clone
        // aborts it through `Shared::drop`.
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.poll_interval;
        state.poll_task = Some(tokio::spawn(async move {
            if immediate {
                let Some(shared) = weak.upgrade() else { return };
                shared.poll_once().await;
            }
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = weak.upgrade() else { return };
                shared.poll_once().await;
            }
        }));
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, link: LinkEvent) {
        self.events.emit(AssistantEvent::Link { link });
    }

    async fn poll_once(&self) {
        let (address, device, was_connected, reconnect_pending) = {
            let state = self.lock();
            let Some(address) = state.address.clone() else {
                return;
            };
            (
                address,
                state.device.clone(),
                state.connected,
                state.reconnect_pending,
            )
        };

        let connected = match self.controller.is_connected(&address).await {
            Ok(connected) => connected,
            Err(e) => {
                debug!(error = %e, "Bluetooth status check failed");
                return;
            }
        };

        match (was_connected, connected) {
            (true, false) => {
                warn!(device = %device, "Bluetooth device disconnected");
                {
                    let mut state = self.lock();
                    state.connected = false;
                    state.reconnect_pending = true;
                    state.stable_polls = 0;
                }
                self.emit(LinkEvent::Disconnected {
                    device: device.clone(),
                });
                self.reconnect(&address, &device).await;
            }
            (false, false) if reconnect_pending => {
                self.reconnect(&address, &device).await;
            }
            (false, false) => {
                debug!(device = %device, "Bluetooth device still disconnected");
            }
            (false, true) => {
                info!(device = %device, "Bluetooth device connected");
                {
                    let mut state = self.lock();
                    state.connected = true;
                    state.reconnect_pending = false;
                    state.stable_polls = 0;
                }
                self.reassert_routing(&device).await;
                self.emit(LinkEvent::Connected { device });
            }
            (true, true) => {
                let check = {
                    let mut state = self.lock();
                    state.stable_polls += 1;
                    if state.stable_polls >= self.config.drift_check_every.max(1) {
                        state.stable_polls = 0;
                        true
                    } else {
                        false
                    }
                };
                if check {
                    self.correct_drift(&device).await;
                }
            }
        }
    }

    async fn reconnect(&self, address: &str, device: &str) {
        let attempts = self.config.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.controller.connect(address).await {
                Ok(()) => {
                    info!(device, attempt, "Bluetooth device reconnected");
                    {
                        let mut state = self.lock();
                        state.connected = true;
                        state.reconnect_pending = false;
                        state.stable_polls = 0;
                    }
                    self.reassert_routing(device).await;
                    self.emit(LinkEvent::Reconnected {
                        device: device.to_string(),
                        attempts: attempt,
                    });
                    return;
                }
                Err(e) => {
                    warn!(device, attempt, attempts, error = %e, "Bluetooth reconnect attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reconnect_wait).await;
                    }
                }
            }
        }

        self.lock().reconnect_pending = false;
        error!(device, attempts, "Bluetooth reconnect gave up");
        self.emit(LinkEvent::ReconnectFailed {
            device: device.to_string(),
            attempts,
        });
    }

    async fn reassert_routing(&self, device: &str) {
        if let Err(e) = self.devices.ensure_output_device(device).await {
            debug!(device, error = %e, "Output route re-assert failed");
        }
        if let Err(e) = self.devices.ensure_input_device(device).await {
            debug!(device, error = %e, "Input route re-assert failed");
        }
    }

    async fn correct_drift(&self, device: &str) {
        let current = match self.devices.current_output_device().await {
            Ok(current) => current,
            Err(e) => {
                debug!(error = %e, "Output drift check failed");
                return;
            }
        };
        if current == device {
            return;
        }
        info!(expected = device, current = %current, "Output device drifted, correcting");
        match self.devices.ensure_output_device(device).await {
            Ok(()) => self.emit(LinkEvent::DriftCorrected {
                device: device.to_string(),
                from: current,
            }),
            Err(e) => debug!(device, error = %e, "Drift correction failed"),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.lock().poll_task.take() {
            task.abort();
        }
    }
}
