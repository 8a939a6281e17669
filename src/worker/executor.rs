use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use uuid::Uuid;

use crate::model::RunStatus;

const DEFAULT_SIMULATED_WORK: Duration = Duration::from_millis(50);

/// Result of interpreting one payload.
#[derive(Debug)]
pub struct PayloadOutcome {
    pub status: RunStatus,
    pub output: String,
    pub error_message: String,
}

/// Interprets payloads by prefix: `cmd:` runs a shell command and captures
/// combined stdout+stderr, `sleep:` sleeps the parsed duration (diagnostic
/// path), anything else is an echo-success.
#[derive(Debug, Clone)]
pub struct PayloadRunner {
    output_limit: usize,
}

impl PayloadRunner {
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }

    pub async fn run(&self, job_id: Uuid, payload: &str) -> PayloadOutcome {
        if let Some(command) = payload.strip_prefix("cmd:") {
            self.execute_command(job_id, command).await
        } else if let Some(duration) = payload.strip_prefix("sleep:") {
            self.simulate_sleep(job_id, duration, payload).await
        } else {
            tokio::time::sleep(DEFAULT_SIMULATED_WORK).await;
            PayloadOutcome {
                status: RunStatus::Completed,
                output: self.bounded(format!("Success: {payload}")),
                error_message: String::new(),
            }
        }
    }

    async fn execute_command(&self, job_id: Uuid, command: &str) -> PayloadOutcome {
        tracing::info!(job_id = %job_id, command, "Executing command");

        let result = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));

                if output.status.success() {
                    tracing::info!(
                        job_id = %job_id,
                        output_bytes = combined.len(),
                        "Command completed"
                    );
                    PayloadOutcome {
                        status: RunStatus::Completed,
                        output: self.bounded(combined),
                        error_message: String::new(),
                    }
                } else {
                    tracing::warn!(
                        job_id = %job_id,
                        exit_code = ?output.status.code(),
                        "Command failed"
                    );
                    PayloadOutcome {
                        status: RunStatus::Failed,
                        output: self.bounded(combined),
                        error_message: format!(
                            "Command failed: exit code {:?}",
                            output.status.code()
                        ),
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Command spawn failed");
                PayloadOutcome {
                    status: RunStatus::Failed,
                    output: String::new(),
                    error_message: e.to_string(),
                }
            }
        }
    }

    async fn simulate_sleep(&self, job_id: Uuid, duration: &str, payload: &str) -> PayloadOutcome {
        match humantime::parse_duration(duration.trim()) {
            Ok(duration) => {
                tracing::info!(job_id = %job_id, ?duration, "Sleeping as requested");
                tokio::time::sleep(duration).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Invalid sleep duration, using default");
                tokio::time::sleep(DEFAULT_SIMULATED_WORK).await;
            }
        }
        PayloadOutcome {
            status: RunStatus::Completed,
            output: self.bounded(format!("Success: {payload}")),
            error_message: String::new(),
        }
    }

    /// Truncate to the configured bound on a char boundary.
    fn bounded(&self, output: String) -> String {
        if output.len() <= self.output_limit {
            return output;
        }
        let mut end = self.output_limit;
        while end > 0 && !output.is_char_boundary(end) {
            end -= 1;
        }
        let mut truncated = output[..end].to_string();
        truncated.push_str("\n[output truncated]");
        truncated
    }
}
