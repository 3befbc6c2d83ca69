//! Testable execution of the OS utilities behind device routing and Bluetooth.
//!
//! `SwitchAudioSource` and `blueutil` are invoked through [`CommandExecutor`],
//! so every controller built on them can be exercised against a mock.

use crate::error::{Result, VoiceError};
use std::collections::VecDeque;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Trait for executing system commands.
///
/// Object-safe, Send + Sync for use in concurrent contexts.
/// Enables testability by allowing mock implementations.
pub trait CommandExecutor: Send + Sync {
    /// Execute a command with arguments.
    ///
    /// Returns the stdout of the command on success.
    /// Returns an error if the command fails or is not found.
    fn execute(&self, command: &str, args: &[&str]) -> Result<String>;
}

/// Production command executor using std::process::Command.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandExecutor;

impl SystemCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for SystemCommandExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(command).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VoiceError::ToolNotFound {
                    tool: command.to_string(),
                }
            } else {
                VoiceError::ToolFailed {
                    tool: command.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::ToolFailed {
                tool: command.to_string(),
                message: format!("exit status {:?}: {}", output.status.code(), stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Runs `tool` on the blocking pool, bounded by `timeout`.
pub async fn execute_with_timeout(
    executor: Arc<dyn CommandExecutor>,
    tool: &str,
    args: Vec<String>,
    timeout: Duration,
) -> Result<String> {
    let owned_tool = tool.to_string();
    let task = tokio::task::spawn_blocking(move || {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        executor.execute(&owned_tool, &args)
    });

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(VoiceError::ToolFailed {
            tool: tool.to_string(),
            message: format!("task failed: {}", join_error),
        }),
        Err(_) => Err(VoiceError::timeout(tool, timeout)),
    }
}

/// Mock command executor for testing.
///
/// Records all command executions and returns queued responses, falling back
/// to a fixed default once the queue is empty.
#[derive(Debug, Default)]
pub struct MockCommandExecutor {
    calls: Mutex<Vec<(String, Vec<String>)>>,
    responses: Mutex<VecDeque<Result<String>>>,
    fallback: Mutex<String>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a successful response to the queue.
    pub fn with_response(self, response: &str) -> Self {
        lock(&self.responses).push_back(Ok(response.to_string()));
        self
    }

    /// Add an error response to the queue.
    pub fn with_error(self, error: VoiceError) -> Self {
        lock(&self.responses).push_back(Err(error));
        self
    }

    /// Output returned once queued responses run out (empty by default).
    pub fn with_fallback(self, response: &str) -> Self {
        *lock(&self.fallback) = response.to_string();
        self
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.calls).clone()
    }

    /// Get the number of recorded calls.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Get a specific call by index.
    pub fn call(&self, index: usize) -> Option<(String, Vec<String>)> {
        lock(&self.calls).get(index).cloned()
    }
}

impl CommandExecutor for MockCommandExecutor {
    fn execute(&self, command: &str, args: &[&str]) -> Result<String> {
        lock(&self.calls).push((
            command.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
        ));

        match lock(&self.responses).pop_front() {
            Some(response) => response,
            None => Ok(lock(&self.fallback).clone()),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
