//! Output/input device routing.
//!
//! Playback and the Bluetooth monitor both pin the system audio route to a
//! named device. On macOS this is `SwitchAudioSource`; tests use
//! [`MockDeviceController`].

use crate::defaults;
use crate::error::{Result, VoiceError};
use crate::system::{CommandExecutor, execute_with_timeout};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Routes system audio to named devices.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Makes `name` the active output device.
    async fn ensure_output_device(&self, name: &str) -> Result<()>;

    /// Name of the currently active output device.
    async fn current_output_device(&self) -> Result<String>;

    /// Makes `name` the active input device.
    async fn ensure_input_device(&self, name: &str) -> Result<()>;
}

/// Device controller backed by the `SwitchAudioSource` utility.
pub struct CommandDeviceController {
    executor: Arc<dyn CommandExecutor>,
    tool: String,
    timeout: Duration,
}

impl CommandDeviceController {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            tool: "SwitchAudioSource".to_string(),
            timeout: Duration::from_millis(defaults::DEVICE_COMMAND_TIMEOUT_MS),
        }
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.tool = tool.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        execute_with_timeout(Arc::clone(&self.executor), &self.tool, args, self.timeout).await
    }

    async fn switch(&self, kind: &str, name: &str) -> Result<()> {
        self.run(vec![
            "-t".to_string(),
            kind.to_string(),
            "-s".to_string(),
            name.to_string(),
        ])
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl DeviceController for CommandDeviceController {
    async fn ensure_output_device(&self, name: &str) -> Result<()> {
        self.switch("output", name).await
    }

    async fn current_output_device(&self) -> Result<String> {
        let out = self
            .run(vec!["-t".to_string(), "output".to_string(), "-c".to_string()])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn ensure_input_device(&self, name: &str) -> Result<()> {
        self.switch("input", name).await
    }
}

/// A call observed by [`MockDeviceController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    EnsureOutput(String),
    CurrentOutput,
    EnsureInput(String),
}

#[derive(Debug)]
struct MockDeviceState {
    output: String,
    input: String,
    calls: Vec<DeviceCall>,
    ignored_switches: u32,
    fail_switches: bool,
}

/// Mock device controller for testing.
///
/// Behaves like a real router: `ensure_output_device` changes what
/// `current_output_device` reports, unless configured to ignore switches.
#[derive(Debug, Clone)]
pub struct MockDeviceController {
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockDeviceController {
    pub fn new(initial_output: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockDeviceState {
                output: initial_output.to_string(),
                input: String::new(),
                calls: Vec::new(),
                ignored_switches: 0,
                fail_switches: false,
            })),
        }
    }

    /// The next `count` output switches report success but change nothing.
    pub fn with_ignored_switches(self, count: u32) -> Self {
        self.lock().ignored_switches = count;
        self
    }

    /// Every switch request returns an error.
    pub fn with_failing_switches(self) -> Self {
        self.lock().fail_switches = true;
        self
    }

    /// Simulates the OS moving output elsewhere behind our back.
    pub fn drift_to(&self, name: &str) {
        self.lock().output = name.to_string();
    }

    pub fn output(&self) -> String {
        self.lock().output.clone()
    }

    pub fn input(&self) -> String {
        self.lock().input.clone()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.lock().calls.clone()
    }

    pub fn ensure_output_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, DeviceCall::EnsureOutput(_)))
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MockDeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DeviceController for MockDeviceController {
    async fn ensure_output_device(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::EnsureOutput(name.to_string()));
        if state.fail_switches {
            return Err(VoiceError::DeviceRouting {
                message: format!("mock refused to switch output to {}", name),
            });
        }
        if state.ignored_switches > 0 {
            state.ignored_switches -= 1;
        } else {
            state.output = name.to_string();
        }
        Ok(())
    }

    async fn current_output_device(&self) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::CurrentOutput);
        Ok(state.output.clone())
    }

    async fn ensure_input_device(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(DeviceCall::EnsureInput(name.to_string()));
        if state.fail_switches {
            return Err(VoiceError::DeviceRouting {
                message: format!("mock refused to switch input to {}", name),
            });
        }
        state.input = name.to_string();
        Ok(())
    }
}
