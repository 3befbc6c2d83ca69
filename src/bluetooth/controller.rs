//! Bluetooth device queries and connection control.

use crate::error::{Result, VoiceError};
use crate::system::{CommandExecutor, execute_with_timeout};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A device from the paired list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PairedDevice {
    pub address: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub connected: bool,
}

#[async_trait]
pub trait BluetoothController: Send + Sync {
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>>;

    async fn is_connected(&self, address: &str) -> Result<bool>;

    async fn connect(&self, address: &str) -> Result<()>;
}

/// Controller backed by the `blueutil` command-line tool.
pub struct BlueutilController {
    executor: Arc<dyn CommandExecutor>,
    tool: String,
    timeout: Duration,
}

impl BlueutilController {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            tool: "blueutil".to_string(),
            // Connecting can take several seconds
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let args = args.iter().map(|s| s.to_string()).collect();
        execute_with_timeout(Arc::clone(&self.executor), &self.tool, args, self.timeout).await
    }
}

/// Parses `blueutil --paired --format json` output.
pub fn parse_paired(json: &str) -> Result<Vec<PairedDevice>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|e| VoiceError::Bluetooth {
        message: format!("unexpected blueutil output: {}", e),
    })
}

#[async_trait]
impl BluetoothController for BlueutilController {
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
        let out = self.run(&["--paired", "--format", "json"]).await?;
        parse_paired(&out)
    }

    async fn is_connected(&self, address: &str) -> Result<bool> {
        let out = self.run(&["--is-connected", address]).await?;
        match out.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(VoiceError::Bluetooth {
                message: format!("unexpected --is-connected output: {:?}", other),
            }),
        }
    }

    async fn connect(&self, address: &str) -> Result<()> {
        self.run(&["--connect", address]).await.map(|_| ())
    }
}

#[derive(Debug, Default)]
struct MockBluetoothState {
    paired: Vec<PairedDevice>,
    connected: HashMap<String, bool>,
    connect_results: VecDeque<bool>,
    connect_calls: usize,
    status_calls: usize,
    fail_listing: bool,
}

/// Mock controller for testing. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockBluetoothController {
    state: Arc<Mutex<MockBluetoothState>>,
}

impl MockBluetoothController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a paired device with its initial connection state.
    pub fn with_device(self, address: &str, name: &str, connected: bool) -> Self {
        {
            let mut state = self.lock();
            state.paired.push(PairedDevice {
                address: address.to_string(),
                name: name.to_string(),
                connected,
            });
            state.connected.insert(address.to_string(), connected);
        }
        self
    }

    /// Queues outcomes for upcoming `connect` calls. Once the queue is empty,
    /// connects succeed.
    pub fn with_connect_results(self, results: &[bool]) -> Self {
        self.lock().connect_results.extend(results.iter().copied());
        self
    }

    pub fn with_listing_failure(self) -> Self {
        self.lock().fail_listing = true;
        self
    }

    /// Simulates the link dropping or returning.
    pub fn set_connected(&self, address: &str, connected: bool) {
        self.lock().connected.insert(address.to_string(), connected);
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    /// Number of connection checks, i.e. polls that ran to their check.
    pub fn status_calls(&self) -> usize {
        self.lock().status_calls
    }

    fn lock(&self) -> MutexGuard<'_, MockBluetoothState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BluetoothController for MockBluetoothController {
    async fn paired_devices(&self) -> Result<Vec<PairedDevice>> {
        let state = self.lock();
        if state.fail_listing {
            return Err(VoiceError::ToolNotFound {
                tool: "blueutil".to_string(),
            });
        }
        Ok(state
            .paired
            .iter()
            .map(|d| PairedDevice {
                connected: state.connected.get(&d.address).copied().unwrap_or(false),
                ..d.clone()
            })
            .collect())
    }

    async fn is_connected(&self, address: &str) -> Result<bool> {
        let mut state = self.lock();
        state.status_calls += 1;
        Ok(state.connected.get(address).copied().unwrap_or(false))
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let mut state = self.lock();
        state.connect_calls += 1;
        let success = state.connect_results.pop_front().unwrap_or(true);
        if success {
            state.connected.insert(address.to_string(), true);
            Ok(())
        } else {
            Err(VoiceError::Bluetooth {
                message: format!("mock connect to {} failed", address),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::MockCommandExecutor;

    const PAIRED_JSON: &str = r#"[
        {"address":"04-52-c7-aa-bb-cc","name":"Razor Buds","connected":true,"favourite":false,"paired":true},
        {"address":"10-94-bb-00-11-22","name":"Desk Keyboard","connected":false,"paired":true}
    ]"#;

    #[test]
    fn test_parses_paired_listing_and_ignores_extra_fields() {
        let devices = parse_paired(PAIRED_JSON).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "Razor Buds");
        assert!(devices[0].connected);
        assert_eq!(devices[1].address, "10-94-bb-00-11-22");
    }

    #[test]
    fn test_empty_listing_is_no_devices() {
        assert!(parse_paired("\n").unwrap().is_empty());
        assert!(matches!(
            parse_paired("not json"),
            Err(VoiceError::Bluetooth { .. })
        ));
    }

    #[tokio::test]
    async fn test_blueutil_commands() {
        let executor = Arc::new(
            MockCommandExecutor::new()
                .with_response(PAIRED_JSON)
                .with_response("0\n")
                .with_response(""),
        );
        let controller = BlueutilController::new(executor.clone());

        assert_eq!(controller.paired_devices().await.unwrap().len(), 2);
        assert!(!controller.is_connected("04-52-c7-aa-bb-cc").await.unwrap());
        controller.connect("04-52-c7-aa-bb-cc").await.unwrap();

        let calls = executor.calls();
        assert_eq!(calls[0].1, vec!["--paired", "--format", "json"]);
        assert_eq!(calls[1].1, vec!["--is-connected", "04-52-c7-aa-bb-cc"]);
        assert_eq!(calls[2].1, vec!["--connect", "04-52-c7-aa-bb-cc"]);
        assert!(calls.iter().all(|(tool, _)| tool == "blueutil"));
    }

    #[tokio::test]
    async fn test_garbage_connection_status_is_an_error() {
        let executor = Arc::new(MockCommandExecutor::new().with_response("maybe"));
        let controller = BlueutilController::new(executor);
        assert!(controller.is_connected("x").await.is_err());
    }

    #[tokio::test]
    async fn test_mock_connect_script() {
        let mock = MockBluetoothController::new()
            .with_device("aa", "Razor Buds", false)
            .with_connect_results(&[false]);

        assert!(mock.connect("aa").await.is_err());
        assert!(!mock.is_connected("aa").await.unwrap());
        mock.connect("aa").await.unwrap();
        assert!(mock.is_connected("aa").await.unwrap());
        assert_eq!(mock.connect_calls(), 2);
        assert!(mock.paired_devices().await.unwrap()[0].connected);
    }
}
